//! Runtime configuration.
//!
//! Defaults match a plain `strava-sync` run in the current directory.
//! Every field can be overridden from the environment:
//!
//! | Variable                     | Field                               |
//! |------------------------------|-------------------------------------|
//! | `STRAVA_CACHE_PATH`          | `cache_path`                        |
//! | `STRAVA_CACHE_BACKUP`        | `keep_backup` (`0`/`1`/`true`/`false`) |
//! | `STRAVA_CHECKPOINT_NEW`      | `sync.checkpoint_every_new`         |
//! | `STRAVA_CHECKPOINT_BACKFILL` | `sync.checkpoint_every_backfill`    |
//! | `USER_MAX_HR`                | `effort.operator_max_hr`            |

use std::path::PathBuf;
use std::str::FromStr;

use log::warn;

use crate::cache::MAX_HR_SANITY_CEILING;
use crate::effort::EffortConfig;
use crate::error::{Result, SyncError};
use crate::retry::RetryConfig;
use crate::sync::SyncOptions;

pub const DEFAULT_CACHE_PATH: &str = "strava_cache.json";

const ENV_CACHE_PATH: &str = "STRAVA_CACHE_PATH";
const ENV_CACHE_BACKUP: &str = "STRAVA_CACHE_BACKUP";
const ENV_CHECKPOINT_NEW: &str = "STRAVA_CHECKPOINT_NEW";
const ENV_CHECKPOINT_BACKFILL: &str = "STRAVA_CHECKPOINT_BACKFILL";
const ENV_USER_MAX_HR: &str = "USER_MAX_HR";

/// Everything needed to assemble a store, retry policy, estimator and engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub cache_path: PathBuf,
    /// Keep the previous revision as `<cache>.bak` on every save
    pub keep_backup: bool,
    pub sync: SyncOptions,
    pub retry: RetryConfig,
    pub effort: EffortConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            keep_backup: true,
            sync: SyncOptions::default(),
            retry: RetryConfig::default(),
            effort: EffortConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(path) = get(ENV_CACHE_PATH) {
            config.cache_path = PathBuf::from(path);
        }
        if let Some(raw) = get(ENV_CACHE_BACKUP) {
            config.keep_backup = parse_flag(ENV_CACHE_BACKUP, &raw)?;
        }
        if let Some(raw) = get(ENV_CHECKPOINT_NEW) {
            config.sync.checkpoint_every_new = parse_number(ENV_CHECKPOINT_NEW, &raw)?;
        }
        if let Some(raw) = get(ENV_CHECKPOINT_BACKFILL) {
            config.sync.checkpoint_every_backfill = parse_number(ENV_CHECKPOINT_BACKFILL, &raw)?;
        }
        if let Some(raw) = get(ENV_USER_MAX_HR) {
            config.effort.operator_max_hr = parse_max_hr(&raw);
        }

        Ok(config)
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| SyncError::Config {
        message: format!("{} must be a non-negative integer, got {:?}", key, raw),
    })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SyncError::Config {
            message: format!("{} must be a boolean, got {:?}", key, raw),
        }),
    }
}

/// An unusable operator max HR falls back to detection instead of failing the run.
fn parse_max_hr(raw: &str) -> Option<u16> {
    match raw.parse::<u16>() {
        Ok(bpm) if bpm > 0 && bpm <= MAX_HR_SANITY_CEILING => Some(bpm),
        Ok(bpm) => {
            warn!(
                "[SyncConfig] Ignoring {}={}: outside 1..={}",
                ENV_USER_MAX_HR, bpm, MAX_HR_SANITY_CEILING
            );
            None
        }
        Err(_) => {
            warn!("[SyncConfig] Ignoring non-numeric {}={:?}", ENV_USER_MAX_HR, raw);
            None
        }
    }
}

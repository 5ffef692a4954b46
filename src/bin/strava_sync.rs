//! `strava-sync`: bring the local activity cache up to date.
//!
//! Reads configuration from the environment (see `strava_sync::config`) and
//! the bearer token from `STRAVA_ACCESS_TOKEN`. Ctrl-C stops the run after
//! the activity in flight, or at once during a rate-limit cooldown; progress
//! is saved either way. A second Ctrl-C exits immediately.
//!
//! Exit codes: 0 success, 2 interrupted, 3 rate limited, 130 aborted,
//! 1 anything else.

use std::process::ExitCode;

use log::{error, info, warn};

use strava_sync::records::calculate_records;
use strava_sync::{
    CacheStore, EffortEstimator, Interrupt, RetryPolicy, StravaClient, SyncConfig, SyncEngine,
    SyncError,
};

const ENV_ACCESS_TOKEN: &str = "STRAVA_ACCESS_TOKEN";

const EXIT_FAILURE: u8 = 1;
const EXIT_INTERRUPTED: u8 = 2;
const EXIT_RATE_LIMITED: u8 = 3;
const EXIT_ABORTED: i32 = 130;

fn main() -> ExitCode {
    strava_sync::init_logging();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[strava-sync] {}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::Interrupted { .. } => EXIT_INTERRUPTED,
        SyncError::RateLimitExceeded { .. } => EXIT_RATE_LIMITED,
        _ => EXIT_FAILURE,
    }
}

fn run() -> strava_sync::Result<()> {
    let config = SyncConfig::from_env()?;
    let token = std::env::var(ENV_ACCESS_TOKEN).map_err(|_| SyncError::Config {
        message: format!("{} is not set", ENV_ACCESS_TOKEN),
    })?;

    let interrupt = Interrupt::new();
    install_ctrl_c(interrupt.clone());

    let store = CacheStore::new(&config.cache_path).keep_backup(config.keep_backup);
    let (mut snapshot, recovered) = store.load_or_recover()?;
    if let Some(aside) = recovered {
        warn!(
            "[strava-sync] Cache was unreadable and moved to {}; continuing with {} activities",
            aside.display(),
            snapshot.len()
        );
    }
    info!(
        "[strava-sync] Loaded {} activities ({} detailed) from {}",
        snapshot.len(),
        snapshot.detailed_count(),
        store.path().display()
    );

    let retry = RetryPolicy::new(config.retry.clone());
    let estimator = EffortEstimator::new(&config.effort);
    let engine = SyncEngine::new(&store, &retry, config.sync.clone()).with_estimator(&estimator);
    let mut client = StravaClient::new(&token)?;

    let report = engine.sync(&mut snapshot, &mut client, &interrupt)?;

    for (id, reason) in &report.failed {
        warn!("[strava-sync] Activity {} not fetched: {}", id, reason);
    }
    if let Some(estimate) = &report.estimate {
        info!(
            "[strava-sync] Max HR {} bpm ({:?}); {} efforts estimated, {} without heart rate",
            estimate.max_hr.bpm,
            estimate.max_hr.source,
            estimate.estimated,
            estimate.missing_heart_rate
        );
    }

    for (sport, records) in calculate_records(snapshot.activities_newest_first()) {
        let distance_km = records
            .longest_distance
            .as_ref()
            .map_or(0.0, |r| r.value / 1000.0);
        info!(
            "[strava-sync] {}: {} activities, longest {:.1} km",
            sport, records.activity_count, distance_km
        );
    }

    Ok(())
}

/// Trigger `interrupt` on Ctrl-C. Failing to install the handler only
/// costs graceful shutdown, so it is logged rather than fatal.
fn install_ctrl_c(interrupt: Interrupt) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("[strava-sync] Ctrl-C handler unavailable: {}", e);
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_err() {
                return;
            }
            info!("[strava-sync] Interrupt received, saving progress (Ctrl-C again to abort)");
            interrupt.trigger();

            // The handler replaced the default SIGINT action; restore a hard exit
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                warn!("[strava-sync] Second interrupt, exiting without saving");
                std::process::exit(EXIT_ABORTED);
            }
        });
    if let Err(e) = spawned {
        warn!("[strava-sync] Ctrl-C handler unavailable: {}", e);
    }
}

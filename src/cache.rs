//! # Activity Cache
//!
//! Durable JSON cache of activities plus sync metadata.
//!
//! ## File Layout
//!
//! ```text
//! strava_cache.json             # current revision
//! strava_cache.json.bak         # previous revision (when backups are on)
//! strava_cache.json.tmp         # in-flight write, renamed over the target
//! strava_cache.json.corrupt-*   # unreadable revisions moved aside on recovery
//! ```
//!
//! Writes go to the `.tmp` file, are fsynced, then renamed over the target,
//! so a reader sees either the old or the new revision, never a torn file.
//! A store is single-owner per run; concurrent processes sharing one file
//! are not supported.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Deserializer, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SyncError};
use crate::types::{optional_timestamp, ActivityRecord};

/// Heart rates above this are treated as sensor noise.
pub const MAX_HR_SANITY_CEILING: u16 = 200;

// ============================================================================
// Snapshot
// ============================================================================

/// In-memory view of the cache: activities keyed by id plus metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "PersistedCache", from = "PersistedCache")]
pub struct CacheSnapshot {
    /// When the cache was last written
    pub last_update: Option<DateTime<Utc>>,
    /// Highest plausible heart rate seen in recent activities
    pub detected_max_hr: Option<u16>,
    /// Start date of the activity that produced `detected_max_hr`
    pub detected_max_hr_date: Option<DateTime<Utc>>,
    activities: HashMap<u64, ActivityRecord>,
}

/// What [`CacheSnapshot::merge`] did with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl CacheSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    pub fn total_activities(&self) -> usize {
        self.activities.len()
    }

    pub fn get(&self, id: u64) -> Option<&ActivityRecord> {
        self.activities.get(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.activities.contains_key(&id)
    }

    /// True when the detail endpoint has been fetched for `id`.
    pub fn is_detailed(&self, id: u64) -> bool {
        self.activities.get(&id).is_some_and(|a| a.detailed)
    }

    pub fn detailed_count(&self) -> usize {
        self.activities.values().filter(|a| a.detailed).count()
    }

    pub fn activities(&self) -> impl Iterator<Item = &ActivityRecord> {
        self.activities.values()
    }

    pub(crate) fn activities_mut(&mut self) -> impl Iterator<Item = &mut ActivityRecord> {
        self.activities.values_mut()
    }

    /// Activities ordered newest first (ties broken by id, descending).
    pub fn activities_newest_first(&self) -> Vec<&ActivityRecord> {
        let mut list: Vec<&ActivityRecord> = self.activities.values().collect();
        list.sort_by(|a, b| b.start_date.cmp(&a.start_date).then(b.id.cmp(&a.id)));
        list
    }

    /// Mark an activity for re-fetch on the next sync.
    /// Returns false if the id is unknown.
    pub fn invalidate(&mut self, id: u64) -> bool {
        match self.activities.get_mut(&id) {
            Some(activity) => {
                activity.detailed = false;
                true
            }
            None => false,
        }
    }

    /// Upsert `incoming` by id.
    ///
    /// Idempotent: merging the same record twice leaves the snapshot as
    /// merging it once. See `ActivityRecord::union` for field precedence.
    pub fn merge(&mut self, incoming: ActivityRecord) -> MergeOutcome {
        match self.activities.get_mut(&incoming.id) {
            None => {
                self.activities.insert(incoming.id, incoming);
                MergeOutcome::Inserted
            }
            Some(existing) => {
                let merged = ActivityRecord::union(existing, &incoming);
                if merged == *existing {
                    MergeOutcome::Unchanged
                } else {
                    *existing = merged;
                    MergeOutcome::Updated
                }
            }
        }
    }
}

/// On-disk form. Field names are part of the file format.
#[derive(Serialize, Deserialize)]
struct PersistedCache {
    #[serde(default, with = "optional_timestamp")]
    last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    total_activities: usize,
    #[serde(default, deserialize_with = "deserialize_bpm")]
    detected_max_hr: Option<u16>,
    #[serde(default, with = "optional_timestamp")]
    detected_max_hr_date: Option<DateTime<Utc>>,
    #[serde(default)]
    activities: Vec<ActivityRecord>,
}

impl From<CacheSnapshot> for PersistedCache {
    fn from(snapshot: CacheSnapshot) -> Self {
        let mut activities: Vec<ActivityRecord> = snapshot.activities.into_values().collect();
        activities.sort_by(|a, b| b.start_date.cmp(&a.start_date).then(b.id.cmp(&a.id)));
        Self {
            last_update: snapshot.last_update,
            total_activities: activities.len(),
            detected_max_hr: snapshot.detected_max_hr,
            detected_max_hr_date: snapshot.detected_max_hr_date,
            activities,
        }
    }
}

impl From<PersistedCache> for CacheSnapshot {
    fn from(persisted: PersistedCache) -> Self {
        let mut snapshot = CacheSnapshot {
            last_update: persisted.last_update,
            detected_max_hr: persisted.detected_max_hr,
            detected_max_hr_date: persisted.detected_max_hr_date,
            activities: HashMap::with_capacity(persisted.activities.len()),
        };
        if snapshot.detected_max_hr.is_none() {
            snapshot.detected_max_hr_date = None;
        }
        // Duplicate ids from hand-edited or very old files collapse via merge
        for activity in persisted.activities {
            snapshot.merge(activity);
        }
        snapshot
    }
}

/// Older caches stored the raw `max_heartrate` float.
fn deserialize_bpm<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u16>, D::Error> {
    let raw = Option::<f64>::deserialize(d)?;
    Ok(raw.and_then(|bpm| {
        let rounded = bpm.round();
        if rounded > 0.0 && rounded <= MAX_HR_SANITY_CEILING as f64 {
            Some(rounded as u16)
        } else {
            None
        }
    }))
}

// ============================================================================
// Store
// ============================================================================

/// Owner of the persisted cache file.
#[derive(Debug, Clone)]
pub struct CacheStore<C: Clock = SystemClock> {
    path: PathBuf,
    keep_backup: bool,
    clock: C,
}

impl CacheStore<SystemClock> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, SystemClock)
    }
}

impl<C: Clock> CacheStore<C> {
    pub fn with_clock(path: impl Into<PathBuf>, clock: C) -> Self {
        Self {
            path: path.into(),
            keep_backup: true,
            clock,
        }
    }

    /// Keep the previous revision as `<path>.bak` on every save (default on).
    pub fn keep_backup(mut self, keep: bool) -> Self {
        self.keep_backup = keep;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    fn temp_path(&self) -> PathBuf {
        sibling(&self.path, "tmp")
    }

    /// Load the cache. A missing file yields an empty snapshot.
    pub fn load(&self) -> Result<CacheSnapshot> {
        Self::read_snapshot(&self.path)
    }

    /// Load the `.bak` revision.
    pub fn restore_backup(&self) -> Result<CacheSnapshot> {
        let backup = self.backup_path();
        if !backup.exists() {
            return Err(SyncError::io(
                backup,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no backup revision"),
            ));
        }
        Self::read_snapshot(&backup)
    }

    /// Load the cache, moving an unreadable file aside instead of failing.
    ///
    /// Returns the snapshot and, if recovery happened, where the corrupt file
    /// now lives so the operator can be told. The backup revision is tried
    /// before falling back to an empty snapshot.
    pub fn load_or_recover(&self) -> Result<(CacheSnapshot, Option<PathBuf>)> {
        match self.load() {
            Ok(snapshot) => Ok((snapshot, None)),
            Err(SyncError::CorruptCache { message, .. }) => {
                let stamp = self.clock.now().format("%Y%m%dT%H%M%SZ");
                let aside = sibling(&self.path, &format!("corrupt-{}", stamp));
                fs::rename(&self.path, &aside).map_err(|e| SyncError::io(&self.path, e))?;
                warn!(
                    "[CacheStore] {} is corrupt ({}), moved to {}",
                    self.path.display(),
                    message,
                    aside.display()
                );

                let snapshot = match self.restore_backup() {
                    Ok(snapshot) => {
                        info!(
                            "[CacheStore] Restored {} activities from backup",
                            snapshot.len()
                        );
                        snapshot
                    }
                    Err(e) => {
                        warn!("[CacheStore] No usable backup ({}), starting empty", e);
                        CacheSnapshot::new()
                    }
                };
                Ok((snapshot, Some(aside)))
            }
            Err(other) => Err(other),
        }
    }

    /// Atomically replace the persisted snapshot.
    ///
    /// Stamps `last_update` on the snapshot before writing.
    pub fn save(&self, snapshot: &mut CacheSnapshot) -> Result<()> {
        // The file stores whole seconds; keep memory and disk identical
        snapshot.last_update = Some(self.clock.now().trunc_subsecs(0));

        let bytes = serde_json::to_vec_pretty(&*snapshot).map_err(|e| SyncError::io(
            &self.path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        ))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }

        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp).map_err(|e| SyncError::io(&tmp, e))?;
            file.write_all(&bytes).map_err(|e| SyncError::io(&tmp, e))?;
            file.sync_all().map_err(|e| SyncError::io(&tmp, e))?;
        }

        if self.keep_backup && self.path.exists() {
            let backup = self.backup_path();
            fs::copy(&self.path, &backup).map_err(|e| SyncError::io(&backup, e))?;
        }

        fs::rename(&tmp, &self.path).map_err(|e| SyncError::io(&self.path, e))?;
        sync_parent_dir(&self.path);

        debug!(
            "[CacheStore] Saved {} activities to {}",
            snapshot.len(),
            self.path.display()
        );
        Ok(())
    }

    fn read_snapshot(path: &Path) -> Result<CacheSnapshot> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[CacheStore] No cache at {}, starting empty", path.display());
                return Ok(CacheSnapshot::new());
            }
            Err(e) => return Err(SyncError::io(path, e)),
        };

        let snapshot: CacheSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| SyncError::CorruptCache {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        debug!(
            "[CacheStore] Loaded {} activities ({} detailed) from {}",
            snapshot.len(),
            snapshot.detailed_count(),
            path.display()
        );
        Ok(snapshot)
    }
}

/// `cache.json` -> `cache.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Best effort: make the rename itself durable.
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 7, 0, 0).unwrap()
    }

    fn record(id: u64, day: u32) -> ActivityRecord {
        let mut r = ActivityRecord::summary(id, at(day), "Run");
        r.name = format!("Run {}", id);
        r.distance = 5000.0;
        r.moving_time = 1500;
        r.average_heartrate = Some(150.0);
        r
    }

    fn detailed(id: u64, day: u32) -> ActivityRecord {
        let mut r = record(id, day);
        r.detailed = true;
        r.calories = Some(410.0);
        r.suffer_score = Some(42.0);
        r
    }

    fn store(dir: &TempDir) -> CacheStore<ManualClock> {
        CacheStore::with_clock(
            dir.path().join("strava_cache.json"),
            ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap()),
        )
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let snapshot = store(&dir).load().unwrap();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.detected_max_hr, None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(detailed(1, 1));
        snapshot.merge(record(2, 2));
        snapshot.detected_max_hr = Some(188);
        snapshot.detected_max_hr_date = Some(at(1));

        store.save(&mut snapshot).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.last_update, Some(Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap()));
        assert!(!dir.path().join("strava_cache.json.tmp").exists());
    }

    #[test]
    fn test_save_truncates_last_update_to_seconds() {
        let dir = TempDir::new().unwrap();
        let stamped = Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(750_123_456);
        let store = CacheStore::with_clock(
            dir.path().join("strava_cache.json"),
            ManualClock::new(stamped),
        );
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(record(1, 1));

        store.save(&mut snapshot).unwrap();

        assert_eq!(
            snapshot.last_update,
            Some(Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(store.load().unwrap(), snapshot);
    }

    #[test]
    fn test_system_clock_save_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = CacheStore::new(dir.path().join("strava_cache.json"));
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(detailed(1, 1));

        store.save(&mut snapshot).unwrap();
        assert_eq!(store.load().unwrap(), snapshot);
    }

    #[test]
    fn test_persisted_format_is_stable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(record(1, 1));
        snapshot.merge(record(2, 5));
        store.save(&mut snapshot).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["total_activities"], 2);
        assert!(raw["detected_max_hr"].is_null());
        assert!(raw["detected_max_hr_date"].is_null());
        assert_eq!(raw["last_update"], "2025-04-01T12:00:00Z");
        // Newest first
        assert_eq!(raw["activities"][0]["id"], 2);
        assert_eq!(raw["activities"][1]["id"], 1);
    }

    #[test]
    fn test_reads_legacy_cache() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(
            store.path(),
            r#"{
              "last_update": "2025-01-14T18:22:05.123456",
              "total_activities": 1,
              "detected_max_hr": 191.0,
              "detected_max_hr_date": "2024-11-02T06:10:00Z",
              "activities": [
                {"id": 77, "name": "Commute", "type": "Ride", "start_date": "2024-11-02T06:10:00Z",
                 "distance": 8000.0, "moving_time": 1200, "max_heartrate": 191.0, "_detailed": true}
              ]
            }"#,
        )
        .unwrap();

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.detected_max_hr, Some(191));
        assert!(snapshot.is_detailed(77));
        assert_eq!(snapshot.get(77).unwrap().kind(), "Ride");
    }

    #[test]
    fn test_noisy_detected_max_hr_dropped() {
        let snapshot: CacheSnapshot = serde_json::from_str(
            r#"{"detected_max_hr": 231, "detected_max_hr_date": "2024-11-02T06:10:00Z", "activities": []}"#,
        )
        .unwrap();
        assert_eq!(snapshot.detected_max_hr, None);
        assert_eq!(snapshot.detected_max_hr_date, None);
    }

    #[test]
    fn test_corrupt_cache_reported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::write(store.path(), b"{\"activities\": [").unwrap();
        assert!(matches!(store.load(), Err(SyncError::CorruptCache { .. })));
        // Nothing moved by a plain load
        assert!(store.path().exists());
    }

    #[test]
    fn test_recover_from_backup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(detailed(1, 1));
        store.save(&mut snapshot).unwrap();
        snapshot.merge(detailed(2, 2));
        store.save(&mut snapshot).unwrap();

        // Backup holds the first revision
        assert_eq!(store.restore_backup().unwrap().len(), 1);

        fs::write(store.path(), b"not json").unwrap();
        let (recovered, aside) = store.load_or_recover().unwrap();
        let aside = aside.expect("corrupt file should be moved aside");
        assert!(aside.exists());
        assert_eq!(fs::read(&aside).unwrap(), b"not json");
        assert_eq!(recovered.len(), 1);
    }

    #[test]
    fn test_recover_without_backup_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).keep_backup(false);
        fs::write(store.path(), b"[1, 2").unwrap();
        let (recovered, aside) = store.load_or_recover().unwrap();
        assert!(recovered.is_empty());
        assert!(aside.is_some());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_merge_idempotent() {
        let mut base = CacheSnapshot::new();
        base.merge(record(1, 1));
        base.merge(detailed(2, 2));

        for incoming in [record(1, 1), detailed(1, 1), record(2, 2), detailed(3, 3)] {
            let mut once = base.clone();
            once.merge(incoming.clone());
            let mut twice = once.clone();
            let second = twice.merge(incoming);
            assert_eq!(once, twice);
            assert_eq!(second, MergeOutcome::Unchanged);
        }
    }

    #[test]
    fn test_merge_summary_never_downgrades_detail() {
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(detailed(1, 1));

        let mut summary = record(1, 1);
        summary.kudos_count = 12;
        summary.suffer_score = None;
        assert_eq!(
            snapshot.merge(summary),
            MergeOutcome::Unchanged
        );

        let kept = snapshot.get(1).unwrap();
        assert!(kept.detailed);
        assert_eq!(kept.calories, Some(410.0));
        assert_eq!(kept.suffer_score, Some(42.0));
    }

    #[test]
    fn test_invalidate() {
        let mut snapshot = CacheSnapshot::new();
        snapshot.merge(detailed(1, 1));
        assert!(snapshot.invalidate(1));
        assert!(!snapshot.is_detailed(1));
        assert!(!snapshot.invalidate(99));
    }
}

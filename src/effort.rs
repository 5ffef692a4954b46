//! Effort estimation for activities without a remote intensity score.
//!
//! Uses a TRIMP-style heuristic on average heart rate:
//!
//! ```text
//! intensity = avg_hr / max_hr
//! effort    = moving_minutes * intensity * (1 + intensity^1.5) * type_factor * 2.5
//! ```
//!
//! ## Max HR Resolution
//!
//! `max_hr` comes from the first resolver in an ordered chain that answers:
//!
//! 1. Operator-supplied value (never written to the cache)
//! 2. Cached detection younger than the freshness threshold (180 days)
//! 3. Scan of activity maxima within the lookback window (730 days)
//! 4. Population default (185 bpm)
//!
//! The freshness threshold decides *whether* to rescan; the lookback window
//! decides *which activities* a rescan looks at. A scan result is stored with
//! the start date of the activity it came from, not the time of the scan.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::cache::{CacheSnapshot, MAX_HR_SANITY_CEILING};
use crate::clock::{Clock, SystemClock};

/// Fallback when there is no heart-rate data at all (220 - 35).
pub const POPULATION_DEFAULT_MAX_HR: u16 = 185;

const EFFORT_SCALE: f64 = 2.5;

/// Per-sport multiplier applied to the effort score.
pub fn type_factor(sport_type: &str) -> f64 {
    match sport_type.to_ascii_lowercase().as_str() {
        "run" | "trailrun" | "virtualrun" => 1.2,
        "ride" | "virtualride" | "ebikeride" | "mountainbikeride" | "gravelride" => 1.0,
        "walk" => 0.8,
        "workout" => 1.1,
        "yoga" => 0.6,
        _ => 1.0,
    }
}

/// Effort score for one activity, rounded to one decimal.
pub fn effort_score(moving_minutes: f64, avg_hr: f64, max_hr: f64, sport_type: &str) -> f64 {
    let intensity = avg_hr / max_hr;
    let effort =
        moving_minutes * intensity * (1.0 + intensity.powf(1.5)) * type_factor(sport_type) * EFFORT_SCALE;
    (effort * 10.0).round() / 10.0
}

// ============================================================================
// Configuration
// ============================================================================

/// Parameters of the max-HR resolver chain.
#[derive(Debug, Clone, PartialEq)]
pub struct EffortConfig {
    /// Fixed max HR from the operator; disables detection entirely
    pub operator_max_hr: Option<u16>,
    /// Cached detections older than this are recomputed
    pub freshness_threshold: Duration,
    /// Activities older than this are ignored by a rescan, unless none are newer
    pub scan_window: Duration,
    /// Use the 95th percentile when the top reading exceeds it by more than this
    pub outlier_gap_bpm: u16,
    pub default_max_hr: u16,
}

impl Default for EffortConfig {
    fn default() -> Self {
        Self {
            operator_max_hr: None,
            freshness_threshold: Duration::days(180),
            scan_window: Duration::days(730),
            outlier_gap_bpm: 10,
            default_max_hr: POPULATION_DEFAULT_MAX_HR,
        }
    }
}

// ============================================================================
// Resolver chain
// ============================================================================

/// Where a max-HR value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxHrSource {
    Operator,
    Cached,
    Detected,
    PopulationDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxHrEstimate {
    pub bpm: u16,
    pub source: MaxHrSource,
    /// Start date of the contributing activity, for cached and detected values
    pub observed_at: Option<DateTime<Utc>>,
}

/// Inputs available to every resolver.
pub struct ResolveContext<'a> {
    pub snapshot: &'a CacheSnapshot,
    pub now: DateTime<Utc>,
}

/// One link of the chain. `None` means "no opinion, ask the next one".
pub trait MaxHrResolver {
    fn name(&self) -> &'static str;
    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MaxHrEstimate>;
}

pub struct OperatorSupplied {
    pub bpm: u16,
}

impl MaxHrResolver for OperatorSupplied {
    fn name(&self) -> &'static str {
        "operator"
    }

    fn resolve(&self, _ctx: &ResolveContext<'_>) -> Option<MaxHrEstimate> {
        Some(MaxHrEstimate {
            bpm: self.bpm,
            source: MaxHrSource::Operator,
            observed_at: None,
        })
    }
}

pub struct FreshCachedValue {
    pub threshold: Duration,
}

impl MaxHrResolver for FreshCachedValue {
    fn name(&self) -> &'static str {
        "cached"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MaxHrEstimate> {
        let bpm = ctx.snapshot.detected_max_hr?;
        let observed_at = ctx.snapshot.detected_max_hr_date?;
        let age = ctx.now - observed_at;
        if age < self.threshold {
            Some(MaxHrEstimate {
                bpm,
                source: MaxHrSource::Cached,
                observed_at: Some(observed_at),
            })
        } else {
            debug!(
                "[EffortEstimator] Cached max HR {} is {} days old, rescanning",
                bpm,
                age.num_days()
            );
            None
        }
    }
}

pub struct ScanActivities {
    pub window: Duration,
    pub outlier_gap_bpm: u16,
}

impl MaxHrResolver for ScanActivities {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Option<MaxHrEstimate> {
        let readings: Vec<(u16, DateTime<Utc>)> = ctx
            .snapshot
            .activities()
            .filter_map(|a| {
                let bpm = a.max_heartrate?.round();
                (bpm > 0.0 && bpm <= MAX_HR_SANITY_CEILING as f64).then_some((bpm as u16, a.start_date))
            })
            .collect();

        let cutoff = ctx.now - self.window;
        let recent: Vec<(u16, DateTime<Utc>)> =
            readings.iter().copied().filter(|(_, date)| *date >= cutoff).collect();
        let mut pool = if recent.is_empty() { readings } else { recent };
        if pool.is_empty() {
            return None;
        }

        pool.sort();
        let top = pool[pool.len() - 1].0;
        let p95 = pool[nearest_rank(pool.len(), 0.95)].0;
        let chosen = if top - p95 > self.outlier_gap_bpm {
            debug!(
                "[EffortEstimator] Top reading {} exceeds p95 {} by more than {}, using p95",
                top, p95, self.outlier_gap_bpm
            );
            p95
        } else {
            top
        };

        // Latest activity carrying the chosen value keeps the detection fresh longest
        let observed_at = pool
            .iter()
            .filter(|(bpm, _)| *bpm == chosen)
            .map(|(_, date)| *date)
            .max();

        Some(MaxHrEstimate {
            bpm: chosen,
            source: MaxHrSource::Detected,
            observed_at,
        })
    }
}

pub struct PopulationDefault {
    pub bpm: u16,
}

impl MaxHrResolver for PopulationDefault {
    fn name(&self) -> &'static str {
        "default"
    }

    fn resolve(&self, _ctx: &ResolveContext<'_>) -> Option<MaxHrEstimate> {
        Some(MaxHrEstimate {
            bpm: self.bpm,
            source: MaxHrSource::PopulationDefault,
            observed_at: None,
        })
    }
}

/// Zero-based index of the nearest-rank percentile in a sorted list of `len`.
fn nearest_rank(len: usize, percentile: f64) -> usize {
    let rank = (percentile * len as f64).ceil() as usize;
    rank.clamp(1, len) - 1
}

// ============================================================================
// Estimator
// ============================================================================

/// Counts from one [`EffortEstimator::estimate`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateReport {
    pub max_hr: MaxHrEstimate,
    /// Scores computed in this pass
    pub estimated: usize,
    /// Activities that already had a score
    pub already_scored: usize,
    /// Activities left unscored for lack of average heart rate
    pub missing_heart_rate: usize,
    /// `detected_max_hr` metadata was rewritten
    pub max_hr_updated: bool,
}

pub struct EffortEstimator<C: Clock = SystemClock> {
    resolvers: Vec<Box<dyn MaxHrResolver>>,
    clock: C,
}

impl EffortEstimator<SystemClock> {
    pub fn new(config: &EffortConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> EffortEstimator<C> {
    pub fn with_clock(config: &EffortConfig, clock: C) -> Self {
        let mut resolvers: Vec<Box<dyn MaxHrResolver>> = Vec::with_capacity(4);
        if let Some(bpm) = config.operator_max_hr {
            resolvers.push(Box::new(OperatorSupplied { bpm }));
        }
        resolvers.push(Box::new(FreshCachedValue {
            threshold: config.freshness_threshold,
        }));
        resolvers.push(Box::new(ScanActivities {
            window: config.scan_window,
            outlier_gap_bpm: config.outlier_gap_bpm,
        }));
        resolvers.push(Box::new(PopulationDefault {
            bpm: config.default_max_hr,
        }));
        Self::with_chain(resolvers, clock)
    }

    /// Build with a custom chain. An exhausted chain falls back to the
    /// population default.
    pub fn with_chain(resolvers: Vec<Box<dyn MaxHrResolver>>, clock: C) -> Self {
        Self { resolvers, clock }
    }

    /// Resolve max HR for `snapshot` without modifying it.
    pub fn resolve_max_hr(&self, snapshot: &CacheSnapshot) -> MaxHrEstimate {
        let ctx = ResolveContext {
            snapshot,
            now: self.clock.now(),
        };
        for resolver in &self.resolvers {
            if let Some(estimate) = resolver.resolve(&ctx) {
                debug!(
                    "[EffortEstimator] Max HR {} bpm from {} resolver",
                    estimate.bpm,
                    resolver.name()
                );
                return estimate;
            }
        }
        MaxHrEstimate {
            bpm: POPULATION_DEFAULT_MAX_HR,
            source: MaxHrSource::PopulationDefault,
            observed_at: None,
        }
    }

    /// Fill in missing intensity scores and refresh the max-HR metadata.
    ///
    /// Activities that already have a score are left untouched, so running
    /// this twice is the same as running it once.
    pub fn estimate(&self, snapshot: &mut CacheSnapshot) -> EstimateReport {
        let max_hr = self.resolve_max_hr(snapshot);

        let mut max_hr_updated = false;
        if max_hr.source == MaxHrSource::Detected
            && (snapshot.detected_max_hr != Some(max_hr.bpm)
                || snapshot.detected_max_hr_date != max_hr.observed_at)
        {
            info!(
                "[EffortEstimator] Detected max HR {} bpm (observed {:?}), was {:?}",
                max_hr.bpm, max_hr.observed_at, snapshot.detected_max_hr
            );
            snapshot.detected_max_hr = Some(max_hr.bpm);
            snapshot.detected_max_hr_date = max_hr.observed_at;
            max_hr_updated = true;
        }

        let mut estimated = 0;
        let mut already_scored = 0;
        let mut missing_heart_rate = 0;
        let max_bpm = max_hr.bpm as f64;

        for activity in snapshot.activities_mut() {
            if activity.suffer_score.is_some() {
                already_scored += 1;
                continue;
            }
            let Some(avg_hr) = activity.average_heartrate.filter(|hr| *hr > 0.0) else {
                missing_heart_rate += 1;
                continue;
            };
            let score = effort_score(activity.moving_minutes(), avg_hr, max_bpm, activity.kind());
            activity.suffer_score = Some(score);
            activity.effort_estimated = true;
            estimated += 1;
        }

        if estimated > 0 {
            info!(
                "[EffortEstimator] Estimated {} scores with max HR {} bpm ({:?}), {} without heart rate",
                estimated, max_hr.bpm, max_hr.source, missing_heart_rate
            );
        }

        EstimateReport {
            max_hr,
            estimated,
            already_scored,
            missing_heart_rate,
            max_hr_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::ActivityRecord;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn estimator(config: EffortConfig) -> EffortEstimator<ManualClock> {
        EffortEstimator::with_clock(&config, ManualClock::new(now()))
    }

    fn activity(id: u64, days_ago: i64, kind: &str, avg: Option<f64>, max: Option<f64>) -> ActivityRecord {
        let mut a = ActivityRecord::summary(id, now() - Duration::days(days_ago), kind);
        a.moving_time = 1800;
        a.average_heartrate = avg;
        a.max_heartrate = max;
        a
    }

    fn snapshot(activities: Vec<ActivityRecord>) -> CacheSnapshot {
        let mut s = CacheSnapshot::new();
        for a in activities {
            s.merge(a);
        }
        s
    }

    #[test]
    fn test_effort_formula() {
        let intensity: f64 = 155.0 / 185.0;
        assert!((intensity - 0.8378).abs() < 1e-4);
        let effort = effort_score(30.0, 155.0, 185.0, "Run");
        assert!((effort - 133.2).abs() < 1.0, "effort was {}", effort);
    }

    #[test]
    fn test_type_factors() {
        assert_eq!(type_factor("Run"), 1.2);
        assert_eq!(type_factor("VirtualRun"), 1.2);
        assert_eq!(type_factor("ride"), 1.0);
        assert_eq!(type_factor("Walk"), 0.8);
        assert_eq!(type_factor("Workout"), 1.1);
        assert_eq!(type_factor("Yoga"), 0.6);
        assert_eq!(type_factor("Kitesurf"), 1.0);
    }

    #[test]
    fn test_estimate_deterministic() {
        let mut s = snapshot(vec![activity(1, 3, "Run", Some(155.0), None)]);
        let est = estimator(EffortConfig {
            operator_max_hr: Some(185),
            ..EffortConfig::default()
        });
        let report = est.estimate(&mut s);

        assert_eq!(report.estimated, 1);
        let scored = s.get(1).unwrap();
        assert!((scored.suffer_score.unwrap() - 133.2).abs() < 1.0);
        assert!(scored.effort_estimated);
    }

    #[test]
    fn test_missing_heart_rate_left_unscored() {
        let mut s = snapshot(vec![activity(1, 3, "Ride", None, None)]);
        let report = estimator(EffortConfig::default()).estimate(&mut s);
        assert_eq!(report.missing_heart_rate, 1);
        assert_eq!(s.get(1).unwrap().suffer_score, None);
        assert!(!s.get(1).unwrap().effort_estimated);
    }

    #[test]
    fn test_remote_score_untouched_and_idempotent() {
        let mut remote = activity(1, 3, "Run", Some(150.0), Some(180.0));
        remote.suffer_score = Some(57.0);
        let mut s = snapshot(vec![remote, activity(2, 4, "Run", Some(140.0), Some(170.0))]);
        let est = estimator(EffortConfig::default());

        est.estimate(&mut s);
        let after_first = s.clone();
        let report = est.estimate(&mut s);

        assert_eq!(s, after_first);
        assert_eq!(report.estimated, 0);
        assert_eq!(report.already_scored, 2);
        assert_eq!(s.get(1).unwrap().suffer_score, Some(57.0));
        assert!(!s.get(1).unwrap().effort_estimated);
    }

    #[test]
    fn test_operator_value_never_written() {
        let mut s = snapshot(vec![activity(1, 10, "Run", Some(150.0), Some(196.0))]);
        s.detected_max_hr = Some(181);
        s.detected_max_hr_date = Some(now() - Duration::days(400));

        let report = estimator(EffortConfig {
            operator_max_hr: Some(178),
            ..EffortConfig::default()
        })
        .estimate(&mut s);

        assert_eq!(report.max_hr.source, MaxHrSource::Operator);
        assert_eq!(report.max_hr.bpm, 178);
        assert!(!report.max_hr_updated);
        assert_eq!(s.detected_max_hr, Some(181));
        assert_eq!(s.detected_max_hr_date, Some(now() - Duration::days(400)));
    }

    #[test]
    fn test_fresh_cached_value_reused() {
        let mut s = snapshot(vec![activity(1, 10, "Run", Some(150.0), Some(196.0))]);
        s.detected_max_hr = Some(183);
        s.detected_max_hr_date = Some(now() - Duration::days(90));

        let report = estimator(EffortConfig::default()).estimate(&mut s);
        assert_eq!(report.max_hr.source, MaxHrSource::Cached);
        assert_eq!(report.max_hr.bpm, 183);
        assert!(!report.max_hr_updated);
        assert_eq!(s.detected_max_hr, Some(183));
    }

    #[test]
    fn test_stale_cached_value_rescanned_with_activity_date() {
        let mut s = snapshot(vec![
            activity(1, 10, "Run", Some(150.0), Some(189.0)),
            activity(2, 40, "Ride", Some(140.0), Some(176.0)),
            activity(3, 900, "Run", Some(160.0), Some(199.0)),
        ]);
        s.detected_max_hr = Some(183);
        s.detected_max_hr_date = Some(now() - Duration::days(200));

        let report = estimator(EffortConfig::default()).estimate(&mut s);
        assert_eq!(report.max_hr.source, MaxHrSource::Detected);
        assert_eq!(report.max_hr.bpm, 189);
        assert!(report.max_hr_updated);
        assert_eq!(s.detected_max_hr, Some(189));
        // Date of the contributing activity, not the scan time
        assert_eq!(s.detected_max_hr_date, Some(now() - Duration::days(10)));
    }

    #[test]
    fn test_scan_ignores_sensor_noise() {
        let mut s = snapshot(vec![
            activity(1, 5, "Run", Some(150.0), Some(238.0)),
            activity(2, 6, "Run", Some(150.0), Some(184.0)),
        ]);
        let report = estimator(EffortConfig::default()).estimate(&mut s);
        assert_eq!(report.max_hr.bpm, 184);
    }

    #[test]
    fn test_scan_falls_back_to_all_history() {
        let mut s = snapshot(vec![activity(1, 1000, "Run", Some(150.0), Some(192.0))]);
        let report = estimator(EffortConfig::default()).estimate(&mut s);
        assert_eq!(report.max_hr.source, MaxHrSource::Detected);
        assert_eq!(report.max_hr.bpm, 192);
    }

    #[test]
    fn test_scan_uses_percentile_for_outlier() {
        // 20 readings at 175..=184 plus one spike at 199
        let mut activities: Vec<ActivityRecord> = (0..20)
            .map(|i| activity(i + 1, i as i64 + 1, "Ride", None, Some(175.0 + (i % 10) as f64)))
            .collect();
        activities.push(activity(100, 2, "Ride", None, Some(199.0)));
        let s = snapshot(activities);

        let est = estimator(EffortConfig::default());
        let resolved = est.resolve_max_hr(&s);
        // 21 readings, nearest rank ceil(19.95) = 20 -> 184
        assert_eq!(resolved.bpm, 184);
    }

    #[test]
    fn test_population_default_without_hr() {
        let mut s = snapshot(vec![activity(1, 1, "Yoga", None, None)]);
        let report = estimator(EffortConfig::default()).estimate(&mut s);
        assert_eq!(report.max_hr.source, MaxHrSource::PopulationDefault);
        assert_eq!(report.max_hr.bpm, POPULATION_DEFAULT_MAX_HR);
        assert_eq!(s.detected_max_hr, None);
    }

    #[test]
    fn test_custom_chain_first_answer_wins() {
        struct Never;
        impl MaxHrResolver for Never {
            fn name(&self) -> &'static str {
                "never"
            }
            fn resolve(&self, _ctx: &ResolveContext<'_>) -> Option<MaxHrEstimate> {
                None
            }
        }
        let est = EffortEstimator::with_chain(
            vec![Box::new(Never), Box::new(OperatorSupplied { bpm: 170 }), Box::new(PopulationDefault { bpm: 185 })],
            ManualClock::new(now()),
        );
        assert_eq!(est.resolve_max_hr(&CacheSnapshot::new()).bpm, 170);

        let empty = EffortEstimator::with_chain(vec![Box::new(Never)], ManualClock::new(now()));
        assert_eq!(empty.resolve_max_hr(&CacheSnapshot::new()).bpm, POPULATION_DEFAULT_MAX_HR);
    }

    #[test]
    fn test_nearest_rank() {
        assert_eq!(nearest_rank(1, 0.95), 0);
        assert_eq!(nearest_rank(10, 0.95), 9);
        assert_eq!(nearest_rank(40, 0.95), 37);
    }
}

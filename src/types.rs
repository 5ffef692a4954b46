//! Activity data as stored in the cache.
//!
//! Field names follow the Strava v3 activity JSON so that cache files written
//! by earlier exporter versions (and raw API payloads) deserialize unchanged.
//! Anything the struct does not model is kept in [`ActivityRecord::extra`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Activity Record
// ============================================================================

/// One activity, either a list-endpoint summary or a fetched detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Remote identifier, unique within the cache
    pub id: u64,
    #[serde(default)]
    pub name: String,
    /// Start time (UTC)
    #[serde(with = "timestamp")]
    pub start_date: DateTime<Utc>,
    /// Strava sport type ("Run", "Ride", "TrailRun", ...). Older payloads only
    /// carry `type`, which stays in `extra`; see [`ActivityRecord::kind`].
    #[serde(default)]
    pub sport_type: String,
    /// Distance in meters
    #[serde(default)]
    pub distance: f64,
    /// Moving time in seconds
    #[serde(default)]
    pub moving_time: u32,
    /// Total elevation gain in meters
    #[serde(default)]
    pub total_elevation_gain: f64,
    #[serde(default)]
    pub average_heartrate: Option<f64>,
    #[serde(default)]
    pub max_heartrate: Option<f64>,
    #[serde(default)]
    pub kudos_count: u32,
    /// Intensity score, remote-supplied or estimated locally
    #[serde(default)]
    pub suffer_score: Option<f64>,

    // Detail endpoint only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_watts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_watts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighted_average_watts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_watts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kilojoules: Option<f64>,

    /// Detail endpoint has been fetched for this activity
    #[serde(rename = "_detailed", default)]
    pub detailed: bool,
    /// `suffer_score` was computed locally rather than supplied remotely
    #[serde(
        rename = "_effort_estimated",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub effort_estimated: bool,

    /// Remote fields not modeled above, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ActivityRecord {
    /// Create a summary-only record.
    pub fn summary(id: u64, start_date: DateTime<Utc>, sport_type: &str) -> Self {
        Self {
            id,
            name: String::new(),
            start_date,
            sport_type: sport_type.to_string(),
            distance: 0.0,
            moving_time: 0,
            total_elevation_gain: 0.0,
            average_heartrate: None,
            max_heartrate: None,
            kudos_count: 0,
            suffer_score: None,
            calories: None,
            average_watts: None,
            max_watts: None,
            weighted_average_watts: None,
            device_watts: None,
            kilojoules: None,
            detailed: false,
            effort_estimated: false,
            extra: Map::new(),
        }
    }

    /// Activity type tag, preferring `sport_type` over the legacy `type`.
    pub fn kind(&self) -> &str {
        if !self.sport_type.is_empty() {
            return &self.sport_type;
        }
        self.extra
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
    }

    /// Moving time in minutes.
    pub fn moving_minutes(&self) -> f64 {
        self.moving_time as f64 / 60.0
    }

    /// Pace in seconds per kilometer, `None` without distance.
    pub fn pace_seconds_per_km(&self) -> Option<f64> {
        if self.distance > 0.0 {
            Some(self.moving_time as f64 / (self.distance / 1000.0))
        } else {
            None
        }
    }

    /// Union of two versions of the same activity.
    ///
    /// The detailed side is primary; on a tie `incoming` is primary since it
    /// is the newer observation. Scalar fields come from the primary side,
    /// optional fields are filled from the secondary side where the primary
    /// has none, and `extra` keys are unioned with the primary winning.
    pub(crate) fn union(existing: &ActivityRecord, incoming: &ActivityRecord) -> ActivityRecord {
        let (primary, secondary) = if existing.detailed && !incoming.detailed {
            (existing, incoming)
        } else {
            (incoming, existing)
        };

        let mut merged = primary.clone();
        fill(&mut merged.average_heartrate, &secondary.average_heartrate);
        fill(&mut merged.max_heartrate, &secondary.max_heartrate);
        fill(&mut merged.calories, &secondary.calories);
        fill(&mut merged.average_watts, &secondary.average_watts);
        fill(&mut merged.max_watts, &secondary.max_watts);
        fill(
            &mut merged.weighted_average_watts,
            &secondary.weighted_average_watts,
        );
        fill(&mut merged.device_watts, &secondary.device_watts);
        fill(&mut merged.kilojoules, &secondary.kilojoules);

        // The estimate flag travels with whichever side supplied the score
        if merged.suffer_score.is_none() {
            merged.suffer_score = secondary.suffer_score;
            merged.effort_estimated = secondary.effort_estimated;
        }

        if merged.name.is_empty() {
            merged.name = secondary.name.clone();
        }
        if merged.sport_type.is_empty() {
            merged.sport_type = secondary.sport_type.clone();
        }

        for (key, value) in &secondary.extra {
            merged
                .extra
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        merged.detailed = existing.detailed || incoming.detailed;
        merged
    }
}

fn fill<T: Clone>(target: &mut Option<T>, fallback: &Option<T>) {
    if target.is_none() {
        target.clone_from(fallback);
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Parse a cache/API timestamp. Accepts RFC 3339 (`2024-05-01T07:30:00Z`)
/// and naive ISO 8601 without offset, which is read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Serde adapter for required timestamps.
pub(crate) mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_timestamp(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", raw)))
    }
}

/// Serde adapter for optional timestamps (`null` or missing is `None`).
pub(crate) mod optional_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match dt {
            Some(dt) => s.serialize_str(&super::format_timestamp(dt)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(raw) => super::parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp '{}'", raw))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn run(id: u64) -> ActivityRecord {
        let mut r = ActivityRecord::summary(id, Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap(), "Run");
        r.distance = 10_000.0;
        r.moving_time = 3000;
        r
    }

    #[test]
    fn test_deserialize_strava_summary() {
        let json = r#"{
            "id": 123456789,
            "name": "Morning Run",
            "type": "Run",
            "sport_type": "Run",
            "start_date": "2024-05-01T07:00:00Z",
            "distance": 10012.4,
            "moving_time": 3120,
            "total_elevation_gain": 54.0,
            "average_heartrate": 151.2,
            "max_heartrate": 176.0,
            "kudos_count": 4,
            "map": {"summary_polyline": "abc"}
        }"#;
        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 123456789);
        assert_eq!(record.kind(), "Run");
        assert!(!record.detailed);
        assert_eq!(record.suffer_score, None);
        assert!(record.extra.contains_key("map"));
        assert!(record.extra.contains_key("type"));
    }

    #[test]
    fn test_legacy_type_only() {
        let json = r#"{"id": 1, "type": "Ride", "start_date": "2019-01-01T00:00:00Z"}"#;
        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind(), "Ride");
    }

    #[test]
    fn test_extra_fields_survive_roundtrip() {
        let json = r#"{"id": 9, "start_date": "2024-01-01T00:00:00Z", "gear_id": "b123", "_detailed": true}"#;
        let record: ActivityRecord = serde_json::from_str(json).unwrap();
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["gear_id"], "b123");
        assert_eq!(back["_detailed"], true);
        assert!(back.get("_effort_estimated").is_none());
    }

    #[test]
    fn test_parse_naive_timestamp_as_utc() {
        let dt = parse_timestamp("2025-01-14T18:22:05.123456").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 14, 18, 22, 5).unwrap() + chrono::Duration::microseconds(123456));
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_union_prefers_detailed() {
        let mut summary = run(1);
        summary.kudos_count = 9;
        let mut detail = run(1);
        detail.detailed = true;
        detail.calories = Some(640.0);
        detail.kudos_count = 7;

        let merged = ActivityRecord::union(&detail, &summary);
        assert!(merged.detailed);
        assert_eq!(merged.calories, Some(640.0));
        assert_eq!(merged.kudos_count, 7);
    }

    #[test]
    fn test_union_keeps_local_estimate() {
        let mut summary = run(1);
        summary.suffer_score = Some(88.0);
        summary.effort_estimated = true;
        let mut detail = run(1);
        detail.detailed = true;

        let merged = ActivityRecord::union(&summary, &detail);
        assert_eq!(merged.suffer_score, Some(88.0));
        assert!(merged.effort_estimated);

        detail.suffer_score = Some(61.0);
        let merged = ActivityRecord::union(&summary, &detail);
        assert_eq!(merged.suffer_score, Some(61.0));
        assert!(!merged.effort_estimated);
    }

    #[test]
    fn test_pace() {
        assert_eq!(run(1).pace_seconds_per_km(), Some(300.0));
        let mut r = run(2);
        r.distance = 0.0;
        assert_eq!(r.pace_seconds_per_km(), None);
    }
}

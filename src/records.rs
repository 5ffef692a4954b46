//! Personal records per sport type.
//!
//! Scans cached activities and keeps, for every sport type, the activity
//! holding each record:
//! - Longest distance
//! - Longest moving time
//! - Most elevation gain
//! - Best pace (seconds per km, activities with distance and moving time only)
//!
//! Ties keep the activity seen first, so pass activities in a stable order
//! (e.g. [`CacheSnapshot::activities_newest_first`](crate::CacheSnapshot::activities_newest_first)).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ActivityRecord;

/// One record and the activity that set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalRecord {
    pub activity_id: u64,
    pub activity_name: String,
    pub start_date: DateTime<Utc>,
    /// Meters, seconds, meters or seconds per km depending on the record
    pub value: f64,
}

impl PersonalRecord {
    fn from_activity(activity: &ActivityRecord, value: f64) -> Self {
        Self {
            activity_id: activity.id,
            activity_name: activity.name.clone(),
            start_date: activity.start_date,
            value,
        }
    }
}

/// Records for a single sport type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SportRecords {
    pub activity_count: u32,
    pub longest_distance: Option<PersonalRecord>,
    pub longest_moving_time: Option<PersonalRecord>,
    pub most_elevation: Option<PersonalRecord>,
    /// Lowest seconds per km
    pub best_pace: Option<PersonalRecord>,
}

impl SportRecords {
    fn observe(&mut self, activity: &ActivityRecord) {
        self.activity_count += 1;

        update_max(&mut self.longest_distance, activity, activity.distance);
        update_max(
            &mut self.longest_moving_time,
            activity,
            activity.moving_time as f64,
        );
        update_max(&mut self.most_elevation, activity, activity.total_elevation_gain);

        if activity.moving_time == 0 {
            return;
        }
        if let Some(pace) = activity.pace_seconds_per_km() {
            let better = self.best_pace.as_ref().map_or(true, |best| pace < best.value);
            if better {
                self.best_pace = Some(PersonalRecord::from_activity(activity, pace));
            }
        }
    }
}

/// Zero never counts as a record.
fn update_max(slot: &mut Option<PersonalRecord>, activity: &ActivityRecord, value: f64) {
    if !(value > 0.0) {
        return;
    }
    let better = slot.as_ref().map_or(true, |current| value > current.value);
    if better {
        *slot = Some(PersonalRecord::from_activity(activity, value));
    }
}

/// Compute personal records grouped by sport type (sorted by name).
pub fn calculate_records<'a, I>(activities: I) -> BTreeMap<String, SportRecords>
where
    I: IntoIterator<Item = &'a ActivityRecord>,
{
    let mut by_sport: BTreeMap<String, SportRecords> = BTreeMap::new();
    for activity in activities {
        by_sport
            .entry(activity.kind().to_string())
            .or_default()
            .observe(activity);
    }
    by_sport
}

//! # Strava Sync
//!
//! Incremental synchronization of Strava activities into a local JSON cache.
//!
//! This library provides:
//! - A durable activity cache with atomic, checkpointed writes
//! - Rate-limit aware retry around every remote call
//! - An incremental sync engine that only fetches what the cache lacks
//! - Effort estimation for activities without a remote intensity score
//!
//! ## Features
//!
//! - **`http`** - Enable the Strava HTTP client and the `strava-sync` binary
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use strava_sync::{
//!     CacheStore, EffortConfig, EffortEstimator, Interrupt, RetryPolicy, StravaClient,
//!     SyncEngine, SyncOptions,
//! };
//!
//! let store = CacheStore::new("strava_cache.json");
//! let mut snapshot = store.load()?;
//!
//! let retry = RetryPolicy::default();
//! let estimator = EffortEstimator::new(&EffortConfig::default());
//! let engine = SyncEngine::new(&store, &retry, SyncOptions::default()).with_estimator(&estimator);
//!
//! let mut client = StravaClient::new(&token)?;
//! let report = engine.sync(&mut snapshot, &mut client, &Interrupt::new())?;
//! println!("fetched {} activities", report.fetched);
//! ```

// Unified error handling
pub mod error;
pub use error::{FetchError, OptionExt, Result, RetryError, SyncError};

// Activity record and timestamp handling
pub mod types;
pub use types::ActivityRecord;

// Injectable time source
pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

// Retry around remote calls
pub mod retry;
pub use retry::{RetryConfig, RetryPolicy};

// Persistent cache
pub mod cache;
pub use cache::{CacheSnapshot, CacheStore, MergeOutcome};

// Effort estimation and max HR detection
pub mod effort;
pub use effort::{
    effort_score, EffortConfig, EffortEstimator, EstimateReport, MaxHrEstimate, MaxHrResolver,
    MaxHrSource,
};

// Cooperative cancellation
pub mod interrupt;
pub use interrupt::Interrupt;

// Sync engine
pub mod sync;
pub use sync::{ActivitySource, SyncEngine, SyncOptions, SyncReport};

// Runtime configuration
pub mod config;
pub use config::SyncConfig;

// Personal records per sport type
pub mod records;
pub use records::{calculate_records, SportRecords};

// Strava HTTP client (optional)
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::StravaClient;

/// Install `env_logger` with an `info` default, overridable via `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .try_init();
}

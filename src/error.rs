//! Unified error handling for the sync library.
//!
//! Three layers of failure are distinguished:
//! - [`FetchError`]: how a single remote call failed, as reported by an
//!   [`ActivitySource`](crate::ActivitySource).
//! - [`RetryError`]: what is left once the retry policy has given up.
//! - [`SyncError`]: what the caller of the sync engine sees, with enough
//!   context (activity in flight, attempts, time waited) to report or resume.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Outcome classification for one remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Request quota exceeded. The server may suggest how long to wait.
    #[error("throttled by remote API (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },
    /// Connection reset, timeout, 5xx and similar. Worth retrying.
    #[error("transient network failure: {message}")]
    Transient { message: String },
    /// Credentials are no longer valid. Retrying cannot help.
    #[error("authorization expired: {message}")]
    AuthExpired { message: String },
    /// The server refused this particular request (404, malformed body, ...).
    #[error("request rejected{}: {message}", status_suffix(.status_code))]
    Rejected {
        message: String,
        status_code: Option<u16>,
    },
}

/// Terminal failure of [`RetryPolicy::execute`](crate::RetryPolicy::execute).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("rate limit exceeded after {attempts} attempts ({}s waited)", .waited.as_secs())]
    RateLimitExceeded { attempts: u32, waited: Duration },
    #[error("network failure persisted after {attempts} attempts: {message}")]
    TransientExhausted {
        attempts: u32,
        waited: Duration,
        message: String,
    },
    #[error("authorization expired: {message}")]
    AuthExpired { message: String },
    #[error("request rejected{}: {message}", status_suffix(.status_code))]
    Rejected {
        message: String,
        status_code: Option<u16>,
    },
    /// Operator stopped the run while a retry was pending.
    #[error("interrupted after {attempts} attempts ({}s waited)", .waited.as_secs())]
    Interrupted { attempts: u32, waited: Duration },
}

impl RetryError {
    /// Attach the activity in flight and lift into a [`SyncError`].
    ///
    /// `Interrupted` carries no loop position here; the sync engine fills
    /// in its own counts.
    pub fn into_sync_error(self, activity_id: Option<u64>) -> SyncError {
        match self {
            RetryError::RateLimitExceeded { attempts, waited } => SyncError::RateLimitExceeded {
                activity_id,
                attempts,
                waited,
            },
            RetryError::TransientExhausted {
                attempts, message, ..
            } => SyncError::TransientNetworkFailure {
                activity_id,
                attempts,
                message,
            },
            RetryError::AuthExpired { message } => SyncError::AuthExpired { message },
            RetryError::Rejected {
                message,
                status_code,
            } => SyncError::Rejected {
                activity_id,
                message,
                status_code,
            },
            RetryError::Interrupted { .. } => SyncError::Interrupted {
                processed: 0,
                remaining: 0,
            },
        }
    }
}

/// Error type for cache, sync and configuration operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Persisted cache could not be parsed. The file is left in place.
    #[error("cache file {} is corrupt: {message}", .path.display())]
    CorruptCache { path: PathBuf, message: String },

    /// Retry budget exhausted while throttled. State was checkpointed first.
    #[error(
        "rate limit exceeded {} after {attempts} attempts ({}s waited)",
        target(.activity_id),
        .waited.as_secs()
    )]
    RateLimitExceeded {
        activity_id: Option<u64>,
        attempts: u32,
        waited: Duration,
    },

    /// Network kept failing for the whole retry budget.
    #[error(
        "network failure {} after {attempts} attempts: {message}",
        target(.activity_id)
    )]
    TransientNetworkFailure {
        activity_id: Option<u64>,
        attempts: u32,
        message: String,
    },

    #[error("authorization expired: {message}")]
    AuthExpired { message: String },

    #[error(
        "request rejected {}{}: {message}",
        target(.activity_id),
        status_suffix(.status_code)
    )]
    Rejected {
        activity_id: Option<u64>,
        message: String,
        status_code: Option<u16>,
    },

    /// Operator asked to stop. Progress up to the interruption was saved.
    #[error("sync interrupted after {processed} activities ({remaining} remaining)")]
    Interrupted { processed: usize, remaining: usize },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when running again later can make progress without operator action.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimitExceeded { .. }
                | SyncError::TransientNetworkFailure { .. }
                | SyncError::Interrupted { .. }
        )
    }
}

fn target(activity_id: &Option<u64>) -> String {
    match activity_id {
        Some(id) => format!("on activity {}", id),
        None => "while listing activities".to_string(),
    }
}

fn status_suffix(status_code: &Option<u16>) -> String {
    status_code.map(|c| format!(" ({})", c)).unwrap_or_default()
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Extension trait for converting Option to SyncError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a configuration error.
    fn ok_or_config(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_config(self, message: &str) -> Result<T> {
        self.ok_or_else(|| SyncError::Config {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::RateLimitExceeded {
            activity_id: Some(42),
            attempts: 5,
            waited: Duration::from_secs(3600),
        };
        let text = err.to_string();
        assert!(text.contains("activity 42"));
        assert!(text.contains("5 attempts"));
        assert!(text.contains("3600s"));

        let err = SyncError::TransientNetworkFailure {
            activity_id: None,
            attempts: 5,
            message: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("while listing"));
    }

    #[test]
    fn test_retry_error_carries_activity() {
        let err = RetryError::RateLimitExceeded {
            attempts: 5,
            waited: Duration::from_secs(4500),
        }
        .into_sync_error(Some(7));
        assert!(matches!(
            err,
            SyncError::RateLimitExceeded {
                activity_id: Some(7),
                attempts: 5,
                ..
            }
        ));
        assert!(err.is_resumable());
    }

    #[test]
    fn test_auth_expired_not_resumable() {
        let err = RetryError::AuthExpired {
            message: "401".to_string(),
        }
        .into_sync_error(None);
        assert!(!err.is_resumable());
    }

    #[test]
    fn test_option_ext() {
        let none: Option<u32> = None;
        let result = none.ok_or_config("missing token");
        assert!(matches!(result, Err(SyncError::Config { .. })));
    }
}

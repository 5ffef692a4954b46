//! Rate-limit aware retry around a single remote call.
//!
//! Strava enforces a 15-minute request window, so a throttled call is retried
//! only after the server-suggested cooldown (900 s when none is given).
//! Transient network failures share the same attempt budget with a short
//! exponential backoff. Authorization and request rejections are returned
//! on first sight without consuming an attempt. With an [`Interrupt`], a
//! pending cooldown is abandoned as soon as the flag is raised.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{FetchError, RetryError};
use crate::interrupt::Interrupt;

/// Retry budget and wait durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total calls allowed before giving up (throttled and transient combined)
    pub max_attempts: u32,
    /// Cooldown used when a throttled response carries no wait hint
    pub default_retry_after: Duration,
    /// First backoff for transient failures, doubled on each attempt
    pub transient_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            default_retry_after: Duration::from_secs(900),
            transient_backoff: Duration::from_secs(2),
        }
    }
}

/// Bookkeeping for one outbound call. Discarded when `execute` returns.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub waited: Duration,
    /// When the current backoff ends
    pub deadline: Option<DateTime<Utc>>,
}

impl RetryState {
    fn backoff(&mut self, now: DateTime<Utc>, wait: Duration) {
        self.waited += wait;
        self.deadline = chrono::Duration::from_std(wait).ok().map(|w| now + w);
    }
}

/// Executes remote calls under a [`RetryConfig`].
///
/// Holds no cache state. The only side effects are invoking the call and
/// sleeping on the injected clock.
#[derive(Debug, Clone)]
pub struct RetryPolicy<C: Clock = SystemClock> {
    config: RetryConfig,
    clock: C,
}

impl RetryPolicy<SystemClock> {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl Default for RetryPolicy<SystemClock> {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl<C: Clock> RetryPolicy<C> {
    pub fn with_clock(config: RetryConfig, clock: C) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Invoke `call` until it succeeds, fails permanently, or the attempt
    /// budget runs out.
    ///
    /// With the default budget, a call that is always throttled is invoked
    /// exactly five times with four cooldowns in between; the accumulated
    /// cooldown is reported in [`RetryError::RateLimitExceeded`].
    pub fn execute<T, F>(&self, call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, FetchError>,
    {
        self.run(None, call)
    }

    /// Like [`execute`](Self::execute), but gives up with
    /// [`RetryError::Interrupted`] instead of starting or finishing a
    /// cooldown once `interrupt` is triggered.
    pub fn execute_until<T, F>(&self, interrupt: &Interrupt, call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, FetchError>,
    {
        self.run(Some(interrupt), call)
    }

    fn run<T, F>(&self, interrupt: Option<&Interrupt>, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Result<T, FetchError>,
    {
        let mut state = RetryState::default();

        loop {
            let failure = match call() {
                Ok(value) => {
                    if state.attempts > 0 {
                        debug!(
                            "[RetryPolicy] Succeeded after {} retries ({:?} waited)",
                            state.attempts, state.waited
                        );
                    }
                    return Ok(value);
                }
                Err(FetchError::AuthExpired { message }) => {
                    return Err(RetryError::AuthExpired { message });
                }
                Err(FetchError::Rejected {
                    message,
                    status_code,
                }) => {
                    return Err(RetryError::Rejected {
                        message,
                        status_code,
                    });
                }
                Err(other) => other,
            };

            state.attempts += 1;
            if state.attempts >= self.config.max_attempts {
                return Err(match failure {
                    FetchError::Transient { message } => RetryError::TransientExhausted {
                        attempts: state.attempts,
                        waited: state.waited,
                        message,
                    },
                    _ => RetryError::RateLimitExceeded {
                        attempts: state.attempts,
                        waited: state.waited,
                    },
                });
            }

            let wait = match &failure {
                FetchError::Throttled { retry_after } => {
                    retry_after.unwrap_or(self.config.default_retry_after)
                }
                _ => self.transient_wait(state.attempts),
            };

            let Some(interrupt) = interrupt else {
                self.log_backoff(&failure, &mut state, wait);
                self.clock.sleep(wait);
                continue;
            };
            if interrupt.is_triggered() {
                return Err(Self::interrupted(&state));
            }
            self.log_backoff(&failure, &mut state, wait);
            if !self.clock.sleep_interruptible(wait, interrupt) {
                return Err(Self::interrupted(&state));
            }
        }
    }

    fn log_backoff(&self, failure: &FetchError, state: &mut RetryState, wait: Duration) {
        state.backoff(self.clock.now(), wait);
        warn!(
            "[RetryPolicy] {} (attempt {}/{}), waiting {:?} until {:?}",
            failure, state.attempts, self.config.max_attempts, wait, state.deadline
        );
    }

    fn interrupted(state: &RetryState) -> RetryError {
        debug!(
            "[RetryPolicy] Interrupted after {} attempts ({:?} waited)",
            state.attempts, state.waited
        );
        RetryError::Interrupted {
            attempts: state.attempts,
            waited: state.waited,
        }
    }

    fn transient_wait(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let wait = self.config.transient_backoff.saturating_mul(factor);
        wait.min(self.config.default_retry_after)
    }
}

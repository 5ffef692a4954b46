//! Time source used by the retry policy, the cache and the estimator.
//!
//! Production code uses [`SystemClock`]. [`ManualClock`] never blocks: `sleep`
//! advances its notion of "now" and records the requested duration, which
//! makes throttling and freshness behavior testable without waiting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::interrupt::Interrupt;

/// How often a long sleep looks at the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(250);

/// Wall-clock time and blocking sleep.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);

    /// Sleep up to `duration`, waking early once `interrupt` fires.
    /// Returns false if the sleep was cut short.
    fn sleep_interruptible(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if interrupt.is_triggered() {
                return false;
            }
            let step = remaining.min(INTERRUPT_POLL);
            self.sleep(step);
            remaining -= step;
        }
        !interrupt.is_triggered()
    }
}

/// Real clock backed by `chrono::Utc` and `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

/// Deterministic clock. Cloning shares state, so a test can keep a handle
/// while the code under test owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Durations passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Sum of all requested sleeps.
    pub fn total_slept(&self) -> Duration {
        self.lock().sleeps.iter().sum()
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.lock();
        state.now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A panicking test thread must not hide the recorded state
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.lock();
        state.sleeps.push(duration);
        state.now += chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Nothing can fire during a manual sleep, so only the flag at entry counts.
    fn sleep_interruptible(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        if interrupt.is_triggered() {
            return false;
        }
        self.sleep(duration);
        true
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }

    fn sleep_interruptible(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        (**self).sleep_interruptible(duration, interrupt)
    }
}

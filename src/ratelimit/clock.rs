//! Time sources for the rate limiters.
//!
//! All strategies read time as fractional seconds through the [`Clock`] trait so
//! that window arithmetic can be exercised deterministically in tests.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// A source of timestamps, in seconds.
pub trait Clock: Send + Sync {
    /// The current time in seconds.
    fn now(&self) -> f64;
}

/// Monotonic clock measured from its own creation.
///
/// Used by the in-process strategies, where timestamps never leave the process.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Wall clock in seconds since the Unix epoch.
///
/// The distributed strategy needs this one: scores written by independent
/// processes must share a time base.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
///
/// Cloning shares the underlying time, so a test can keep one handle and give
/// another to the limiter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a manual clock starting at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        *self.now.lock() += seconds;
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, seconds: f64) {
        *self.now.lock() = seconds;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

//! Rate limiting strategy trait shared by every counting algorithm.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Usage reported for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Recorded usage: requests in the window, or consumed tokens for a bucket
    pub count: f64,
    /// Seconds until usage decays if no more requests arrive; never negative
    pub reset_in: f64,
}

impl Usage {
    /// Build a usage report, clamping `reset_in` at zero.
    pub fn new(count: f64, reset_in: f64) -> Self {
        Self {
            count,
            reset_in: reset_in.max(0.0),
        }
    }

    /// `reset_in` as a [`Duration`].
    pub fn reset_in_duration(&self) -> Duration {
        Duration::from_secs_f64(self.reset_in)
    }
}

/// Trait for rate limiting strategies.
///
/// This trait abstracts over the in-process sliding window and token bucket
/// limiters and the store-backed distributed limiter, so that the
/// [`Dispatcher`](super::Dispatcher) can forward to whichever one is bound.
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    /// Identifier of the algorithm, used for observability.
    fn name(&self) -> &'static str;

    /// Decide whether a request for `key` is admitted, recording it if so.
    async fn allow(&self, key: &str) -> Result<bool>;

    /// Current usage for `key`.
    async fn usage(&self, key: &str) -> Result<Usage>;

    /// Install a key-specific policy for all subsequent calls on `key`.
    ///
    /// Already recorded usage is kept.
    fn set_limit(&self, key: &str, max_requests: u64, window_seconds: f64) -> Result<()>;
}

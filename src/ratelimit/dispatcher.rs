//! Runtime-swappable front end for the rate limiting strategies.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, trace};

use super::strategy::{RateLimitStrategy, Usage};
use crate::error::Result;

/// Forwards every call to the currently bound strategy.
///
/// The dispatcher keeps no per-key state. Each call takes its own handle to the
/// active strategy before doing any work, so a call that started before
/// [`bind_strategy`](Self::bind_strategy) finishes on the old strategy while
/// every later call sees only the new one.
pub struct Dispatcher {
    active: RwLock<Arc<dyn RateLimitStrategy>>,
}

impl Dispatcher {
    pub fn new(strategy: Arc<dyn RateLimitStrategy>) -> Self {
        info!(strategy = strategy.name(), "Rate limiter dispatcher initialized");
        Self {
            active: RwLock::new(strategy),
        }
    }

    /// Handle to the active strategy.
    pub fn strategy(&self) -> Arc<dyn RateLimitStrategy> {
        self.active.read().clone()
    }

    /// Replace the active strategy, returning the one it replaces.
    ///
    /// The previous strategy keeps its per-key state and can be bound again.
    pub fn bind_strategy(&self, strategy: Arc<dyn RateLimitStrategy>) -> Arc<dyn RateLimitStrategy> {
        let previous = std::mem::replace(&mut *self.active.write(), strategy);
        info!(
            from = previous.name(),
            to = self.current_strategy_name(),
            "Switched rate limiting strategy"
        );
        previous
    }

    /// Name of the active strategy.
    pub fn current_strategy_name(&self) -> &'static str {
        self.active.read().name()
    }

    /// Check whether a request for `key` is allowed.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        let strategy = self.strategy();
        trace!(key = %key, strategy = strategy.name(), "Dispatching allow");
        strategy.allow(key).await
    }

    /// Current usage for `key`.
    pub async fn usage(&self, key: &str) -> Result<Usage> {
        self.strategy().usage(key).await
    }

    /// Set a custom limit for `key` on the active strategy.
    pub fn set_limit(&self, key: &str, max_requests: u64, window_seconds: f64) -> Result<()> {
        self.strategy().set_limit(key, max_requests, window_seconds)
    }
}

//! Exact sliding window rate limiter.
//!
//! Every admitted request leaves a timestamp in a per-key log. A request is
//! admitted when fewer than `max_requests` timestamps remain after dropping the
//! ones that fell out of the trailing window. Since admission stops at
//! `max_requests`, a log never holds more live entries than that, which bounds
//! the cleanup work per call.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, MonotonicClock};
use super::policy::{LimitPolicy, PolicyTable};
use super::strategy::{RateLimitStrategy, Usage};
use crate::error::Result;

/// Timestamp log for one key, oldest first.
type WindowLog = Arc<Mutex<VecDeque<f64>>>;

/// Sliding window limiter keeping exact per-key request timestamps.
///
/// Keys map to their own lock through a sharded concurrent map, so unrelated
/// keys never contend on one another's critical section.
pub struct SlidingWindowLimiter {
    /// Timestamp logs indexed by key
    windows: DashMap<String, WindowLog>,
    /// Default and per-key limits
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub const NAME: &'static str = "SlidingWindow";

    /// Create a limiter with a default policy, on the monotonic clock.
    pub fn new(max_requests: u64, window_seconds: f64) -> Result<Self> {
        let policy = LimitPolicy::new(max_requests, window_seconds)?;
        Ok(Self::with_clock(policy, Arc::new(MonotonicClock::new())))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(policy: LimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            policies: PolicyTable::new(policy),
            clock,
        }
    }

    /// Get the log for `key`, creating it on first use.
    ///
    /// The map's shard guard is dropped before the caller locks the log.
    fn window(&self, key: &str) -> WindowLog {
        if let Some(log) = self.windows.get(key) {
            return log.value().clone();
        }

        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, "Creating sliding window log");
                Arc::new(Mutex::new(VecDeque::new()))
            })
            .value()
            .clone()
    }

    /// Try to admit one request for `key`.
    pub fn try_acquire(&self, key: &str) -> bool {
        let policy = self.policies.get(key);
        let log = self.window(key);
        let mut log = log.lock();

        let now = self.clock.now();
        purge_expired(&mut log, now - policy.window_seconds);

        let count = log.len() as u64;
        if count < policy.max_requests {
            log.push_back(now);
            trace!(key = %key, count = count + 1, limit = policy.max_requests, "Sliding window: allowed");
            true
        } else {
            debug!(key = %key, count = count, limit = policy.max_requests, "Sliding window: limit exceeded");
            false
        }
    }

    /// Live request count for `key` and seconds until the oldest one expires.
    pub fn current_usage(&self, key: &str) -> Usage {
        let policy = self.policies.get(key);
        let log = self.window(key);
        let mut log = log.lock();

        let now = self.clock.now();
        purge_expired(&mut log, now - policy.window_seconds);

        match log.front() {
            Some(oldest) => Usage::new(log.len() as f64, policy.window_seconds - (now - oldest)),
            None => Usage::default(),
        }
    }

    /// Override the limit for `key`; recorded timestamps are kept.
    pub fn set_key_limit(&self, key: &str, policy: LimitPolicy) {
        self.policies.set(key, policy);
    }

    /// Number of keys that have a timestamp log.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

/// Drop timestamps at or before `cutoff` from the front of the log.
fn purge_expired(log: &mut VecDeque<f64>, cutoff: f64) {
    while log.front().is_some_and(|&ts| ts <= cutoff) {
        log.pop_front();
    }
}

#[async_trait]
impl RateLimitStrategy for SlidingWindowLimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn allow(&self, key: &str) -> Result<bool> {
        Ok(self.try_acquire(key))
    }

    async fn usage(&self, key: &str) -> Result<Usage> {
        Ok(self.current_usage(key))
    }

    fn set_limit(&self, key: &str, max_requests: u64, window_seconds: f64) -> Result<()> {
        let policy = LimitPolicy::new(max_requests, window_seconds)?;
        self.set_key_limit(key, policy);
        Ok(())
    }
}

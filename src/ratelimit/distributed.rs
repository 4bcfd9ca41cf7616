//! Distributed rate limiter using a shared window store.
//!
//! This module provides a sliding window limiter whose per-key state lives in
//! an external store shared by independent processes. All read-check-write
//! logic runs inside the store as one atomic unit; this side only supplies the
//! policy and the timestamp, and never keeps a local copy of the window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::policy::{LimitPolicy, PolicyTable};
use super::store::{StoreResult, WindowAttempt, WindowStore};
use super::strategy::{RateLimitStrategy, Usage};
use crate::error::{BackendError, Result};

/// Default bound on a single store round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// A distributed sliding window rate limiter.
///
/// Store failures and timeouts are returned as
/// [`RateLimitError::Backend`](crate::error::RateLimitError::Backend), never as a
/// denial, so the caller chooses whether to fail open or closed.
pub struct DistributedRateLimiter {
    /// The shared store holding the windows.
    store: Arc<dyn WindowStore>,
    /// Default and per-key limits.
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl DistributedRateLimiter {
    pub const NAME: &'static str = "DistributedAtomic";

    /// Create a distributed rate limiter on the wall clock.
    pub fn new(store: Arc<dyn WindowStore>, max_requests: u64, window_seconds: f64) -> Result<Self> {
        let policy = LimitPolicy::new(max_requests, window_seconds)?;
        Ok(Self::with_clock(store, policy, Arc::new(SystemClock)))
    }

    /// Create a distributed rate limiter reading time from `clock`.
    ///
    /// Limiters sharing a store must share a time base.
    pub fn with_clock(store: Arc<dyn WindowStore>, policy: LimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policies: PolicyTable::new(policy),
            clock,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound each store round trip by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one store operation under the timeout.
    ///
    /// On timeout the store may or may not have applied the operation.
    async fn round_trip<T, F>(&self, key: &str, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!(key = %key, operation = operation, error = %err, "Window store failed");
                Err(err.into())
            }
            Err(_) => {
                warn!(
                    key = %key,
                    operation = operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Window store timed out"
                );
                Err(BackendError::Timeout(self.timeout).into())
            }
        }
    }

    /// Check the rate limit for `key` in the shared store.
    pub async fn check(&self, key: &str) -> Result<bool> {
        let policy = self.policies.get(key);
        let now = self.clock.now();
        let attempt = WindowAttempt {
            now,
            window_seconds: policy.window_seconds,
            max_requests: policy.max_requests,
            member: format!("{:.6}-{}", now, Uuid::new_v4()),
        };

        trace!(key = %key, limit = policy.max_requests, "Checking distributed rate limit");

        let outcome = self.round_trip(key, "record", self.store.record(key, &attempt)).await?;

        if !outcome.admitted {
            debug!(
                key = %key,
                count = outcome.count,
                limit = policy.max_requests,
                "Distributed rate limit exceeded"
            );
        }
        Ok(outcome.admitted)
    }

    /// Current usage of `key` according to the shared store.
    pub async fn current_usage(&self, key: &str) -> Result<Usage> {
        let policy = self.policies.get(key);
        let now = self.clock.now();

        let snapshot = self
            .round_trip(key, "inspect", self.store.inspect(key, now, policy.window_seconds))
            .await?;

        Ok(match snapshot.oldest {
            Some(oldest) => Usage::new(snapshot.count as f64, oldest + policy.window_seconds - now),
            None => Usage::default(),
        })
    }

    /// Override the limit for `key`. Only future attempts see it; the store is untouched.
    pub fn set_key_limit(&self, key: &str, policy: LimitPolicy) {
        self.policies.set(key, policy);
    }
}

#[async_trait]
impl RateLimitStrategy for DistributedRateLimiter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn allow(&self, key: &str) -> Result<bool> {
        self.check(key).await
    }

    async fn usage(&self, key: &str) -> Result<Usage> {
        self.current_usage(key).await
    }

    fn set_limit(&self, key: &str, max_requests: u64, window_seconds: f64) -> Result<()> {
        let policy = LimitPolicy::new(max_requests, window_seconds)?;
        self.set_key_limit(key, policy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::store::{MemoryWindowStore, WindowOutcome, WindowSnapshot};

    const T0: f64 = 1_700_000_000.0;

    fn limiter(
        store: Arc<MemoryWindowStore>,
        clock: &ManualClock,
        max_requests: u64,
        window_seconds: f64,
    ) -> DistributedRateLimiter {
        let policy = LimitPolicy::new(max_requests, window_seconds).unwrap();
        DistributedRateLimiter::with_clock(store, policy, Arc::new(clock.clone()))
    }

    /// A store that never answers.
    struct StalledStore;

    #[async_trait]
    impl WindowStore for StalledStore {
        async fn record(&self, _key: &str, _attempt: &WindowAttempt) -> StoreResult<WindowOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(WindowOutcome { admitted: true, count: 1 })
        }

        async fn inspect(&self, _key: &str, _now: f64, _window: f64) -> StoreResult<WindowSnapshot> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(WindowSnapshot::default())
        }
    }

    /// A store whose connection is gone.
    struct UnreachableStore;

    #[async_trait]
    impl WindowStore for UnreachableStore {
        async fn record(&self, _key: &str, _attempt: &WindowAttempt) -> StoreResult<WindowOutcome> {
            Err(BackendError::Connection("connection refused".to_string()))
        }

        async fn inspect(&self, _key: &str, _now: f64, _window: f64) -> StoreResult<WindowSnapshot> {
            Err(BackendError::Connection("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_distributed_limiter_exact_limit() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store, &clock, 5, 10.0);

        for i in 1..=5 {
            assert!(limiter.check("user_123").await.unwrap(), "Request {} should be OK", i);
        }
        assert!(!limiter.check("user_123").await.unwrap());

        clock.set(T0 + 10.01);
        assert!(limiter.check("user_123").await.unwrap());
    }

    #[tokio::test]
    async fn test_denied_attempts_do_not_count() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store.clone(), &clock, 2, 10.0);

        limiter.check("key").await.unwrap();
        clock.advance(5.0);
        limiter.check("key").await.unwrap();

        for _ in 0..5 {
            assert!(!limiter.check("key").await.unwrap());
        }
        assert_eq!(store.entry_count("key"), 2);

        clock.set(T0 + 10.5);
        assert!(limiter.check("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_distributed_usage() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store, &clock, 5, 10.0);

        assert_eq!(limiter.current_usage("key").await.unwrap(), Usage::default());

        limiter.check("key").await.unwrap();
        clock.advance(3.0);
        limiter.check("key").await.unwrap();
        clock.advance(1.0);

        let usage = limiter.current_usage("key").await.unwrap();
        assert_eq!(usage.count, 2.0);
        assert!((usage.reset_in - 6.0).abs() < 1e-6);

        clock.set(T0 + 20.0);
        assert_eq!(limiter.current_usage("key").await.unwrap(), Usage::default());
    }

    #[tokio::test]
    async fn test_independent_limiters_race_for_last_slot() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let node_a = limiter(store.clone(), &clock, 3, 10.0);
        let node_b = limiter(store.clone(), &clock, 3, 10.0);

        assert!(node_a.check("shared").await.unwrap());
        assert!(node_b.check("shared").await.unwrap());

        let (a, b) = tokio::join!(node_a.check("shared"), node_b.check("shared"));
        let admitted = [a.unwrap(), b.unwrap()].iter().filter(|ok| **ok).count();

        assert_eq!(admitted, 1);
        assert_eq!(store.entry_count("shared"), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_nodes_never_double_admit() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let node = limiter(store.clone(), &clock, 5, 10.0);
                tokio::spawn(async move { node.check("shared").await.unwrap() })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_set_limit_does_not_touch_store() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store.clone(), &clock, 2, 10.0);

        limiter.check("key").await.unwrap();
        limiter.check("key").await.unwrap();

        limiter.set_limit("key", 3, 10.0).unwrap();
        assert_eq!(store.entry_count("key"), 2);

        assert!(limiter.check("key").await.unwrap());
        assert!(!limiter.check("key").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_limit_rejects_invalid_values() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store, &clock, 2, 10.0);

        let err = limiter.set_limit("key", 0, 10.0).unwrap_err();
        assert!(matches!(err, RateLimitError::InvalidLimit { .. }));
    }

    #[tokio::test]
    async fn test_store_expiry_follows_key_window() {
        let store = Arc::new(MemoryWindowStore::new());
        let clock = ManualClock::new(T0);
        let limiter = limiter(store.clone(), &clock, 5, 10.0);

        limiter.set_limit("short", 5, 2.0).unwrap();
        limiter.check("short").await.unwrap();

        assert!(store.contains_key("short", T0 + 1.9));
        assert!(!store.contains_key("short", T0 + 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_backend_failure() {
        let limiter = DistributedRateLimiter::new(Arc::new(StalledStore), 5, 10.0)
            .unwrap()
            .with_timeout(Duration::from_millis(50));

        let err = limiter.check("key").await.unwrap_err();
        assert!(err.is_backend());
        assert!(matches!(
            err,
            RateLimitError::Backend(BackendError::Timeout(t)) if t == Duration::from_millis(50)
        ));

        let err = limiter.current_usage("key").await.unwrap_err();
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_denial() {
        let limiter = DistributedRateLimiter::new(Arc::new(UnreachableStore), 5, 10.0).unwrap();

        let err = limiter.allow("key").await.unwrap_err();
        assert!(matches!(err, RateLimitError::Backend(BackendError::Connection(_))));
        assert!(limiter.usage("key").await.unwrap_err().is_backend());
    }

    #[test]
    fn test_default_timeout() {
        let limiter = DistributedRateLimiter::new(Arc::new(MemoryWindowStore::new()), 5, 10.0).unwrap();
        assert_eq!(limiter.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(limiter.name(), "DistributedAtomic");
    }
}

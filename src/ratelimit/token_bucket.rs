//! Token bucket rate limiter.
//!
//! Each key owns a bucket holding up to `max_requests` tokens that refills
//! continuously at `max_requests / window_seconds` tokens per second. A request
//! spends one token. This smooths bursts rather than enforcing an exact ceiling
//! per window, in exchange for constant-size state per key.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, MonotonicClock};
use super::policy::{LimitPolicy, PolicyTable};
use super::strategy::{RateLimitStrategy, Usage};
use crate::error::Result;

/// Slack for refill arithmetic, so a token accrued exactly on time is not lost to rounding.
const TOKEN_EPSILON: f64 = 1e-9;

/// Refill state of one key.
#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: f64,
    capacity: f64,
    refill_rate: f64,
}

impl Bucket {
    fn full(policy: LimitPolicy, now: f64) -> Self {
        Self {
            tokens: policy.max_requests as f64,
            last_refill: now,
            capacity: policy.max_requests as f64,
            refill_rate: policy.rate(),
        }
    }

    /// Credit the tokens accrued since the last refill.
    fn refill(&mut self, now: f64) {
        if now > self.last_refill {
            let accrued = (now - self.last_refill) * self.refill_rate;
            self.tokens = (self.tokens + accrued).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Seconds until the token count reaches its next whole unit.
    fn time_to_next_token(&self) -> f64 {
        if self.tokens + TOKEN_EPSILON >= self.capacity {
            return 0.0;
        }
        let next = (self.tokens.floor() + 1.0).min(self.capacity);
        (next - self.tokens) / self.refill_rate
    }

    /// Switch to a new policy, keeping the tokens already spent.
    fn reconfigure(&mut self, policy: LimitPolicy, now: f64) {
        self.refill(now);
        self.capacity = policy.max_requests as f64;
        self.refill_rate = policy.rate();
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Token bucket limiter with one bucket per key.
pub struct TokenBucketLimiter {
    /// Buckets indexed by key
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    /// Default and per-key limits
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub const NAME: &'static str = "TokenBucket";

    /// Create a limiter with a default policy, on the monotonic clock.
    pub fn new(max_requests: u64, window_seconds: f64) -> Result<Self> {
        let policy = LimitPolicy::new(max_requests, window_seconds)?;
        Ok(Self::with_clock(policy, Arc::new(MonotonicClock::new())))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(policy: LimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            policies: PolicyTable::new(policy),
            clock,
        }
    }

    /// Get the bucket for `key`, creating a full one on first use.
    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.value().clone();
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                let policy = self.policies.get(key);
                debug!(
                    key = %key,
                    capacity = policy.max_requests,
                    refill_rate = policy.rate(),
                    "Creating token bucket"
                );
                Arc::new(Mutex::new(Bucket::full(policy, self.clock.now())))
            })
            .value()
            .clone()
    }

    /// Try to spend one token for `key`.
    pub fn try_acquire(&self, key: &str) -> bool {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock();

        bucket.refill(self.clock.now());
        if bucket.try_consume() {
            trace!(key = %key, tokens = bucket.tokens, "Token bucket: allowed");
            true
        } else {
            debug!(key = %key, tokens = bucket.tokens, "Token bucket: limit exceeded");
            false
        }
    }

    /// Consumed tokens for `key` and seconds until the next whole token.
    pub fn current_usage(&self, key: &str) -> Usage {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock();

        bucket.refill(self.clock.now());
        Usage::new(bucket.capacity - bucket.tokens, bucket.time_to_next_token())
    }

    /// Tokens currently available for `key`.
    pub fn available_tokens(&self, key: &str) -> f64 {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock();

        bucket.refill(self.clock.now());
        bucket.tokens
    }

    /// Override the limit for `key`.
    ///
    /// An existing bucket is settled at its old rate first, then takes the new
    /// capacity and rate; spent tokens are not refunded.
    pub fn set_key_limit(&self, key: &str, policy: LimitPolicy) {
        self.policies.set(key, policy);

        let bucket = self.bucket(key);
        let mut bucket = bucket.lock();
        bucket.reconfigure(policy, self.clock.now());
    }

    /// Number of keys that have a bucket.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl RateLimitStrategy for TokenBucketLimiter {
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

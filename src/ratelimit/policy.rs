//! Limit policies and per-key overrides.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RateLimitError, Result};

/// Maximum requests allowed within a window of `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Requests admitted per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: f64,
}

impl LimitPolicy {
    /// Create a validated policy.
    ///
    /// Both values must be strictly positive and the window must be finite.
    pub fn new(max_requests: u64, window_seconds: f64) -> Result<Self> {
        let policy = Self {
            max_requests,
            window_seconds,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check the invariants of a policy that may have been deserialized.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 || !(self.window_seconds > 0.0) || !self.window_seconds.is_finite() {
            return Err(RateLimitError::InvalidLimit {
                max_requests: self.max_requests,
                window_seconds: self.window_seconds,
            });
        }
        Ok(())
    }

    /// Continuous refill rate in requests per second.
    pub fn rate(&self) -> f64 {
        self.max_requests as f64 / self.window_seconds
    }
}

/// The default policy of a strategy plus its per-key overrides.
#[derive(Debug)]
pub struct PolicyTable {
    default: LimitPolicy,
    overrides: DashMap<String, LimitPolicy>,
}

impl PolicyTable {
    pub fn new(default: LimitPolicy) -> Self {
        Self {
            default,
            overrides: DashMap::new(),
        }
    }

    /// The policy in force for `key`.
    pub fn get(&self, key: &str) -> LimitPolicy {
        self.overrides
            .get(key)
            .map(|policy| *policy)
            .unwrap_or(self.default)
    }

    /// Install an override for `key`, replacing any previous one.
    pub fn set(&self, key: &str, policy: LimitPolicy) {
        debug!(
            key = %key,
            max_requests = policy.max_requests,
            window_seconds = policy.window_seconds,
            "Setting key limit"
        );
        self.overrides.insert(key.to_string(), policy);
    }

    pub fn default_policy(&self) -> LimitPolicy {
        self.default
    }

    /// Number of keys with an override.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

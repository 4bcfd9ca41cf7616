//! Configuration management for Rateswitch.
//!
//! A [`LimiterConfig`] names the strategy to run, its default policy and any
//! per-key overrides. Configuration is only ever read.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{RateLimitError, Result};
use crate::ratelimit::{
    DistributedRateLimiter, LimitPolicy, RateLimitStrategy, RedisWindowStore, SlidingWindowLimiter,
    TokenBucketLimiter, WindowStore, DEFAULT_KEY_PREFIX,
};

/// Prefix of environment variables layered over a configuration file.
pub const ENV_PREFIX: &str = "RATESWITCH";

/// Counting algorithm to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    SlidingWindow,
    TokenBucket,
    Distributed,
}

/// Main configuration for a rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Strategy to build
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Policy for keys without an override
    #[serde(default = "default_limit")]
    pub default_limit: LimitPolicy,

    /// Per-key policies
    #[serde(default)]
    pub overrides: HashMap<String, LimitPolicy>,

    /// Store settings, required by the distributed strategy
    #[serde(default)]
    pub distributed: Option<DistributedConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            default_limit: default_limit(),
            overrides: HashMap::new(),
            distributed: None,
        }
    }
}

fn default_limit() -> LimitPolicy {
    LimitPolicy {
        max_requests: 10,
        window_seconds: 60.0,
    }
}

/// Settings of the shared store used by the distributed strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Prefix prepended to every key in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl DistributedConfig {
    /// Settings for `redis_url` with the default prefix and timeout.
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Scalar settings read from `RATESWITCH__*` environment variables.
///
/// Map-valued settings such as `overrides` are not taken from the environment,
/// since variable names cannot carry case-sensitive keys.
#[derive(Debug, Default, Deserialize)]
struct EnvOverlay {
    #[serde(default)]
    strategy: Option<StrategyKind>,
    #[serde(default)]
    default_limit: Option<PolicyOverlay>,
    #[serde(default)]
    distributed: Option<DistributedOverlay>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyOverlay {
    #[serde(default)]
    max_requests: Option<u64>,
    #[serde(default)]
    window_seconds: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DistributedOverlay {
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default)]
    key_prefix: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl EnvOverlay {
    fn load() -> Result<Self> {
        ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RateLimitError::Config(format!("Failed to read {}__* variables: {}", ENV_PREFIX, e)))
    }

    fn apply(self, config: &mut LimiterConfig) -> Result<()> {
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }

        if let Some(limit) = self.default_limit {
            if let Some(max_requests) = limit.max_requests {
                config.default_limit.max_requests = max_requests;
            }
            if let Some(window_seconds) = limit.window_seconds {
                config.default_limit.window_seconds = window_seconds;
            }
        }

        if let Some(overlay) = self.distributed {
            let mut settings = match (config.distributed.take(), overlay.redis_url) {
                (Some(mut existing), url) => {
                    if let Some(url) = url {
                        existing.redis_url = url;
                    }
                    existing
                }
                (None, Some(url)) => DistributedConfig::new(url),
                (None, None) => {
                    return Err(RateLimitError::Config(format!(
                        "{}__DISTRIBUTED__REDIS_URL is required when no `distributed` section is configured",
                        ENV_PREFIX
                    )))
                }
            };
            if let Some(prefix) = overlay.key_prefix {
                settings.key_prefix = prefix;
            }
            if let Some(timeout_ms) = overlay.timeout_ms {
                settings.timeout_ms = timeout_ms;
            }
            config.distributed = Some(settings);
        }
        Ok(())
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file, with `RATESWITCH__*` environment
    /// variables taking precedence over its scalar settings
    /// (e.g. `RATESWITCH__DEFAULT_LIMIT__MAX_REQUESTS`).
    ///
    /// Override keys are taken verbatim from the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        let mut config: LimiterConfig = serde_yaml::from_str(&contents).map_err(|e| {
            RateLimitError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        EnvOverlay::load()?.apply(&mut config)?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every policy and the settings the chosen strategy needs.
    pub fn validate(&self) -> Result<()> {
        self.default_limit.validate()?;
        for policy in self.overrides.values() {
            policy.validate()?;
        }

        if self.strategy == StrategyKind::Distributed {
            let settings = self.distributed_settings()?;
            if settings.timeout_ms == 0 {
                return Err(RateLimitError::Config("distributed.timeout_ms must be positive".to_string()));
            }
        }
        Ok(())
    }

    fn distributed_settings(&self) -> Result<&DistributedConfig> {
        self.distributed.as_ref().ok_or_else(|| {
            RateLimitError::Config("the distributed strategy requires a `distributed` section".to_string())
        })
    }

    /// Build the configured strategy, connecting to Redis if it is distributed.
    pub async fn build(&self) -> Result<Arc<dyn RateLimitStrategy>> {
        self.validate()?;

        let store: Option<Arc<dyn WindowStore>> = match self.strategy {
            StrategyKind::Distributed => {
                let settings = self.distributed_settings()?;
                let store: Arc<dyn WindowStore> =
                    Arc::new(RedisWindowStore::connect(&settings.redis_url, settings.key_prefix.clone()).await?);
                Some(store)
            }
            StrategyKind::SlidingWindow | StrategyKind::TokenBucket => None,
        };

        self.assemble(store)
    }

    /// Build the configured strategy on a caller-provided store.
    ///
    /// The store is only used by the distributed strategy.
    pub fn build_with_store(&self, store: Arc<dyn WindowStore>) -> Result<Arc<dyn RateLimitStrategy>> {
        self.validate()?;
        self.assemble(Some(store))
    }

    fn assemble(&self, store: Option<Arc<dyn WindowStore>>) -> Result<Arc<dyn RateLimitStrategy>> {
        let LimitPolicy {
            max_requests,
            window_seconds,
        } = self.default_limit;

        let strategy: Arc<dyn RateLimitStrategy> = match self.strategy {
            StrategyKind::SlidingWindow => Arc::new(SlidingWindowLimiter::new(max_requests, window_seconds)?),
            StrategyKind::TokenBucket => Arc::new(TokenBucketLimiter::new(max_requests, window_seconds)?),
            StrategyKind::Distributed => {
                let settings = self.distributed_settings()?;
                let store = store.ok_or_else(|| {
                    RateLimitError::Config("the distributed strategy requires a window store".to_string())
                })?;
                Arc::new(
                    DistributedRateLimiter::new(store, max_requests, window_seconds)?
                        .with_timeout(settings.timeout()),
                )
            }
        };

        for (key, policy) in &self.overrides {
            strategy.set_limit(key, policy.max_requests, policy.window_seconds)?;
        }

        info!(
            strategy = strategy.name(),
            max_requests = max_requests,
            window_seconds = window_seconds,
            overrides = self.overrides.len(),
            "Rate limiting strategy built"
        );
        Ok(strategy)
    }
}

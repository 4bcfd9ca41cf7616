//! Rateswitch - Swappable Per-Key Rate Limiting
//!
//! This crate enforces a maximum request rate per client key. It offers a precise
//! sliding window, an approximate token bucket and a distributed sliding window
//! backed by an atomic store script, all behind one trait, plus a dispatcher that
//! swaps the active algorithm at runtime without touching call sites.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use crate::config::LimiterConfig;
pub use error::{BackendError, RateLimitError, Result};
pub use ratelimit::{
    Dispatcher, DistributedRateLimiter, LimitPolicy, RateLimitStrategy, SlidingWindowLimiter,
    TokenBucketLimiter, Usage,
};

//! Rate limiting strategies and the dispatcher that swaps between them.

pub mod clock;
mod dispatcher;
mod distributed;
mod policy;
mod redis_store;
mod sliding_window;
pub mod store;
mod strategy;
mod token_bucket;

pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use dispatcher::Dispatcher;
pub use distributed::{DistributedRateLimiter, DEFAULT_TIMEOUT};
pub use policy::{LimitPolicy, PolicyTable};
pub use redis_store::{store_key, RedisWindowStore, DEFAULT_KEY_PREFIX};
pub use sliding_window::SlidingWindowLimiter;
pub use store::{MemoryWindowStore, WindowStore};
pub use strategy::{RateLimitStrategy, Usage};
pub use token_bucket::TokenBucketLimiter;

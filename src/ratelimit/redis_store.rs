//! Redis window store.
//!
//! Each key is a sorted set named `prefix + key`, scored by request time in
//! epoch seconds. Both operations run as Lua scripts, which Redis executes
//! without interleaving other commands, so racing processes cannot both take the
//! last slot.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info, trace};

use super::store::{expiry_millis, StoreResult, WindowAttempt, WindowOutcome, WindowSnapshot, WindowStore};
use crate::error::BackendError;

/// Default prefix for window keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate:";

/// Insert, prune, count and decide in one unit. A denied attempt removes its
/// own member so failed requests do not count.
const RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local cutoff = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local ttl_ms = tonumber(ARGV[5])

redis.call('ZADD', key, now, member)
redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)

local count = redis.call('ZCARD', key)
local admitted = 1
if count > limit then
    redis.call('ZREM', key, member)
    count = count - 1
    admitted = 0
end

redis.call('PEXPIRE', key, ttl_ms)
return {admitted, count}
"#;

/// Prune and report. The oldest score comes back as a string since Lua
/// numbers are truncated to integers in replies.
const INSPECT_SCRIPT: &str = r#"
local key = KEYS[1]
local cutoff = tonumber(ARGV[1])

redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff)

local count = redis.call('ZCARD', key)
if count == 0 then
    return {0, ''}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {count, oldest[2]}
"#;

/// Full store key for a rate limited key.
pub fn store_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

/// Window store backed by Redis sorted sets.
///
/// The connection is owned by the caller's [`ConnectionManager`]; this type does
/// not retry or fail over on its own.
pub struct RedisWindowStore {
    conn: ConnectionManager,
    prefix: String,
    record_script: Script,
    inspect_script: Script,
}

impl RedisWindowStore {
    /// Wrap an existing connection.
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            record_script: Script::new(RECORD_SCRIPT),
            inspect_script: Script::new(INSPECT_SCRIPT),
        }
    }

    /// Open a connection to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Connection`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BackendError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let store = Self::new(conn, prefix);
        info!(url = %url, prefix = %store.prefix, "Connected to Redis window store");
        Ok(store)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Delete the window kept for `key`.
    pub async fn reset(&self, key: &str) -> StoreResult<()> {
        let full_key = store_key(&self.prefix, key);
        debug!(key = %full_key, "Resetting window in Redis");

        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(&full_key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn record(&self, key: &str, attempt: &WindowAttempt) -> StoreResult<WindowOutcome> {
        let full_key = store_key(&self.prefix, key);
        let mut conn = self.conn.clone();

        let (admitted, count): (i64, u64) = self
            .record_script
            .key(&full_key)
            .arg(attempt.now)
            .arg(attempt.cutoff())
            .arg(attempt.max_requests)
            .arg(&attempt.member)
            .arg(expiry_millis(attempt.window_seconds))
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %full_key, admitted = admitted, count = count, "Redis store: recorded attempt");
        Ok(WindowOutcome {
            admitted: admitted == 1,
            count,
        })
    }

    async fn inspect(&self, key: &str, now: f64, window_seconds: f64) -> StoreResult<WindowSnapshot> {
        let full_key = store_key(&self.prefix, key);
        let mut conn = self.conn.clone();

        let (count, oldest): (u64, String) = self
            .inspect_script
            .key(&full_key)
            .arg(now - window_seconds)
            .invoke_async(&mut conn)
            .await?;

        let oldest = if count == 0 {
            None
        } else {
            let score = oldest
                .parse::<f64>()
                .map_err(|e| BackendError::Script(format!("invalid score {:?}: {}", oldest, e)))?;
            Some(score)
        };

        Ok(WindowSnapshot { count, oldest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{Clock, SystemClock};

    #[test]
    fn test_store_key_concatenates_prefix() {
        assert_eq!(store_key(DEFAULT_KEY_PREFIX, "user_123"), "rate:user_123");
        assert_eq!(store_key("", "user_123"), "user_123");
    }

    #[test]
    fn test_record_script_removes_denied_member() {
        let insert = RECORD_SCRIPT.find("ZADD").unwrap();
        let prune = RECORD_SCRIPT.find("ZREMRANGEBYSCORE").unwrap();
        let rollback = RECORD_SCRIPT.find("ZREM'").unwrap();
        let expire = RECORD_SCRIPT.find("PEXPIRE").unwrap();

        assert!(insert < prune && prune < rollback && rollback < expire);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = RedisWindowStore::connect("not a url", DEFAULT_KEY_PREFIX)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::Connection(_)));
    }

    // Redis tests require a running Redis instance
    // Run with: cargo test -- --ignored

    const REDIS_URL: &str = "redis://localhost:6379";

    fn attempt(now: f64, max_requests: u64, window_seconds: f64) -> WindowAttempt {
        WindowAttempt {
            now,
            window_seconds,
            max_requests,
            member: format!("{:.6}-{}", now, uuid::Uuid::new_v4()),
        }
    }

    async fn connect(key: &str) -> RedisWindowStore {
        let store = RedisWindowStore::connect(REDIS_URL, DEFAULT_KEY_PREFIX).await.unwrap();
        store.reset(key).await.unwrap();
        store
    }

    async fn zcard(store: &RedisWindowStore, key: &str) -> u64 {
        let mut conn = store.conn.clone();
        redis::cmd("ZCARD")
            .arg(store_key(store.prefix(), key))
            .query_async(&mut conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_record_admits_up_to_limit() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let store = connect(&key).await;
        let now = SystemClock.now();

        // First 3 attempts are admitted
        for i in 0..3 {
            let outcome = store.record(&key, &attempt(now + i as f64 * 0.001, 3, 60.0)).await.unwrap();
            assert_eq!(outcome, WindowOutcome { admitted: true, count: i + 1 });
        }

        // 4th is denied
        let outcome = store.record(&key, &attempt(now + 0.01, 3, 60.0)).await.unwrap();
        assert_eq!(outcome, WindowOutcome { admitted: false, count: 3 });

        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_denied_attempt_leaves_no_entry() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let store = connect(&key).await;
        let now = SystemClock.now();

        store.record(&key, &attempt(now, 1, 60.0)).await.unwrap();
        assert_eq!(zcard(&store, &key).await, 1);

        for i in 1..=5 {
            let outcome = store.record(&key, &attempt(now + i as f64 * 0.001, 1, 60.0)).await.unwrap();
            assert!(!outcome.admitted);
        }
        assert_eq!(zcard(&store, &key).await, 1);

        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_denied_attempt_refreshes_expiry() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let store = connect(&key).await;
        let now = SystemClock.now();

        store.record(&key, &attempt(now, 1, 30.0)).await.unwrap();
        let outcome = store.record(&key, &attempt(now + 0.01, 1, 30.0)).await.unwrap();
        assert!(!outcome.admitted);

        let mut conn = store.conn.clone();
        let ttl_ms: i64 = redis::cmd("PTTL")
            .arg(store_key(store.prefix(), &key))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(ttl_ms > 29_000 && ttl_ms <= 30_000, "unexpected PTTL {}", ttl_ms);

        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires running Redis instance"]
    async fn test_redis_inspect_reports_oldest_score() {
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let store = connect(&key).await;
        let now = SystemClock.now();

        store.record(&key, &attempt(now, 5, 60.0)).await.unwrap();
        store.record(&key, &attempt(now + 0.5, 5, 60.0)).await.unwrap();

        let snapshot = store.inspect(&key, now + 1.0, 60.0).await.unwrap();
        assert_eq!(snapshot.count, 2);
        let oldest = snapshot.oldest.unwrap();
        assert!((oldest - now).abs() < 1e-3, "oldest {} vs {}", oldest, now);

        // Once the first entry leaves the window the second becomes the oldest
        let snapshot = store.inspect(&key, now + 60.2, 60.0).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert!((snapshot.oldest.unwrap() - (now + 0.5)).abs() < 1e-3);

        store.reset(&key).await.unwrap();
        let snapshot = store.inspect(&key, now + 1.0, 60.0).await.unwrap();
        assert_eq!(snapshot, WindowSnapshot::default());
    }
}

//! Shared window stores for the distributed rate limiter.
//!
//! A [`WindowStore`] owns per-key sorted timestamp sets and must run each
//! insert/prune/count/decide sequence as one indivisible unit with respect to
//! other callers on the same key, wherever those callers live.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::BackendError;

/// Result type for store round trips.
pub type StoreResult<T> = std::result::Result<T, BackendError>;

/// One admission attempt against a key's window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAttempt {
    /// Request time, seconds since the Unix epoch
    pub now: f64,
    /// Window length of the key's policy
    pub window_seconds: f64,
    /// Request limit of the key's policy
    pub max_requests: u64,
    /// Set member unique to this attempt
    pub member: String,
}

impl WindowAttempt {
    /// Scores at or below this value are outside the window.
    pub fn cutoff(&self) -> f64 {
        self.now - self.window_seconds
    }
}

/// Decision taken by the store for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub admitted: bool,
    /// Entries in the window after the decision
    pub count: u64,
}

/// Read-only view of a key's window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowSnapshot {
    pub count: u64,
    /// Score of the oldest live entry
    pub oldest: Option<f64>,
}

/// Trait for stores able to run the sliding window sequence atomically.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Insert the attempt, prune expired entries, count, and keep the entry
    /// only if the count is within the limit. Refreshes the key's expiry to the
    /// window length whether or not the attempt is admitted.
    async fn record(&self, key: &str, attempt: &WindowAttempt) -> StoreResult<WindowOutcome>;

    /// Prune expired entries and report what is left.
    async fn inspect(&self, key: &str, now: f64, window_seconds: f64) -> StoreResult<WindowSnapshot>;
}

/// Key expiry for a window, in whole milliseconds, rounded up.
pub fn expiry_millis(window_seconds: f64) -> u64 {
    ((window_seconds * 1000.0).ceil() as u64).max(1)
}

/// Sorted set of one key plus its expiry deadline.
#[derive(Debug, Default)]
struct ScoredSet {
    /// (score, member), ascending by score
    entries: Vec<(f64, String)>,
    expires_at: f64,
}

impl ScoredSet {
    fn insert(&mut self, score: f64, member: String) {
        let at = self.entries.partition_point(|(s, _)| *s <= score);
        self.entries.insert(at, (score, member));
    }

    fn prune(&mut self, cutoff: f64) {
        let expired = self.entries.partition_point(|(s, _)| *s <= cutoff);
        self.entries.drain(..expired);
    }

    fn remove(&mut self, member: &str) {
        self.entries.retain(|(_, m)| m != member);
    }
}

/// Records between two sweeps of expired keys.
const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Default)]
struct MemoryState {
    sets: HashMap<String, ScoredSet>,
    records_since_sweep: u64,
}

impl MemoryState {
    /// Drop every key whose expiry has passed.
    fn sweep(&mut self, now: f64) -> usize {
        let before = self.sets.len();
        self.sets.retain(|_, set| set.expires_at > now);
        self.records_since_sweep = 0;
        before - self.sets.len()
    }
}

/// In-process window store.
///
/// Every operation runs under a single mutex, which gives the same
/// indivisibility a scripted transaction gives on a shared server. Limiters in
/// one process can share it through an `Arc` as if they were separate nodes.
/// Expired keys are dropped when touched and by a periodic sweep on record.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    state: Mutex<MemoryState>,
}

impl MemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries stored for `key`, expired or not.
    pub fn entry_count(&self, key: &str) -> usize {
        self.state.lock().sets.get(key).map_or(0, |set| set.entries.len())
    }

    /// Whether `key` still exists at time `now`.
    pub fn contains_key(&self, key: &str, now: f64) -> bool {
        self.state
            .lock()
            .sets
            .get(key)
            .is_some_and(|set| set.expires_at > now)
    }

    /// Number of keys held, including expired ones not yet reclaimed.
    pub fn key_count(&self) -> usize {
        self.state.lock().sets.len()
    }

    /// Reclaim every key expired at `now`, returning how many were dropped.
    pub fn purge_expired(&self, now: f64) -> usize {
        self.state.lock().sweep(now)
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    async fn record(&self, key: &str, attempt: &WindowAttempt) -> StoreResult<WindowOutcome> {
        let mut state = self.state.lock();

        state.records_since_sweep += 1;
        if state.records_since_sweep >= SWEEP_INTERVAL {
            let reclaimed = state.sweep(attempt.now);
            if reclaimed > 0 {
                debug!(reclaimed = reclaimed, "Memory store: reclaimed expired keys");
            }
        }

        let set = state.sets.entry(key.to_string()).or_default();
        if set.expires_at <= attempt.now {
            set.entries.clear();
        }

        set.insert(attempt.now, attempt.member.clone());
        set.prune(attempt.cutoff());

        let mut count = set.entries.len() as u64;
        let admitted = count <= attempt.max_requests;
        if !admitted {
            set.remove(&attempt.member);
            count -= 1;
        }

        set.expires_at = attempt.now + expiry_millis(attempt.window_seconds) as f64 / 1000.0;

        trace!(key = %key, admitted = admitted, count = count, "Memory store: recorded attempt");
        Ok(WindowOutcome { admitted, count })
    }

    async fn inspect(&self, key: &str, now: f64, window_seconds: f64) -> StoreResult<WindowSnapshot> {
        let mut state = self.state.lock();
        let sets = &mut state.sets;
        let Some(set) = sets.get_mut(key) else {
            return Ok(WindowSnapshot::default());
        };

        if set.expires_at <= now {
            sets.remove(key);
            return Ok(WindowSnapshot::default());
        }

        set.prune(now - window_seconds);
        Ok(WindowSnapshot {
            count: set.entries.len() as u64,
            oldest: set.entries.first().map(|(score, _)| *score),
        })
    }
}

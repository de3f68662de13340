//! Expectations: the barrier between issuing writes and observing them.
//!
//! A controller records how many creates and deletes it has issued for a
//! fleet key. Until the cache reports that many creations and deletions (or
//! the record goes stale), further scale decisions for that key are unsafe
//! because they would be computed against a cache that lags the store.
//!
//! # Invariants
//!
//! - A key with no record is satisfied
//! - A record older than the TTL is satisfied, so a lost watch event cannot
//!   stall a fleet forever
//! - Failed writes are rolled back with the matching `*_observed` call

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Default age after which an unfulfilled record is ignored.
pub const DEFAULT_EXPECTATIONS_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Record {
    adds: i64,
    dels: i64,
    timestamp: Instant,
}

impl Record {
    fn new(adds: i64, dels: i64) -> Self {
        Self {
            adds,
            dels,
            timestamp: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.adds <= 0 && self.dels <= 0
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() > ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Missing,
    Fulfilled,
    Expired,
    Pending,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-key pending create/delete counters.
#[derive(Debug)]
pub struct ControllerExpectations {
    records: Mutex<HashMap<String, Record>>,
    ttl: Duration,
}

impl Default for ControllerExpectations {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerExpectations {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_EXPECTATIONS_TTL)
    }

    /// Expectations whose records go stale after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Overwrite the counters for `key` and restart its clock.
    pub fn set_expectations(&self, key: &str, adds: i64, dels: i64) {
        debug!(key, adds, dels, "Setting expectations");
        lock(&self.records).insert(key.to_string(), Record::new(adds, dels));
    }

    /// Expect `adds` creations and nothing else.
    pub fn expect_creations(&self, key: &str, adds: i64) {
        self.set_expectations(key, adds, 0);
    }

    /// Expect `dels` deletions and nothing else.
    pub fn expect_deletions(&self, key: &str, dels: i64) {
        self.set_expectations(key, 0, dels);
    }

    /// Add to the counters for `key`, creating the record if needed.
    ///
    /// A record that was already fulfilled or stale starts a fresh clock.
    pub fn raise_expectations(&self, key: &str, add: i64, del: i64) {
        let mut records = lock(&self.records);
        match records.get_mut(key) {
            Some(record) => {
                if record.fulfilled() || record.expired(self.ttl) {
                    record.timestamp = Instant::now();
                }
                record.adds += add;
                record.dels += del;
            }
            None => {
                records.insert(key.to_string(), Record::new(add, del));
            }
        }
        debug!(key, add, del, "Raised expectations");
    }

    /// Subtract from the counters for `key`. Missing records are left alone.
    pub fn lower_expectations(&self, key: &str, add: i64, del: i64) {
        if let Some(record) = lock(&self.records).get_mut(key) {
            record.adds -= add;
            record.dels -= del;
        }
    }

    /// One expected creation showed up, or its create call failed.
    pub fn creation_observed(&self, key: &str) {
        self.lower_expectations(key, 1, 0);
    }

    /// One expected deletion showed up, or its delete call failed.
    pub fn deletion_observed(&self, key: &str) {
        self.lower_expectations(key, 0, 1);
    }

    /// Returns true if a scale decision for `key` may proceed.
    pub fn satisfied_expectations(&self, key: &str) -> bool {
        match self.state(key) {
            RecordState::Missing | RecordState::Fulfilled => true,
            RecordState::Expired => {
                info!(key, "Expectations expired");
                true
            }
            RecordState::Pending => {
                debug!(key, "Controller still waiting on expectations");
                false
            }
        }
    }

    /// Forget `key` entirely, e.g. once its fleet is gone.
    pub fn delete_expectations(&self, key: &str) {
        lock(&self.records).remove(key);
    }

    /// Current `(adds, dels)` for `key`.
    pub fn get(&self, key: &str) -> Option<(i64, i64)> {
        lock(&self.records).get(key).map(|r| (r.adds, r.dels))
    }

    fn expired(&self, key: &str) -> bool {
        lock(&self.records)
            .get(key)
            .is_some_and(|r| r.expired(self.ttl))
    }

    fn state(&self, key: &str) -> RecordState {
        match lock(&self.records).get(key) {
            None => RecordState::Missing,
            Some(r) if r.fulfilled() => RecordState::Fulfilled,
            Some(r) if r.expired(self.ttl) => RecordState::Expired,
            Some(_) => RecordState::Pending,
        }
    }
}

/// Expectations that also remember exactly which children are being deleted.
///
/// A deletion observation only counts when it names a child in the expected
/// set, so duplicate or unrelated delete events are not double-counted.
#[derive(Debug, Default)]
pub struct UidTrackingExpectations {
    counts: ControllerExpectations,
    deleting: Mutex<HashMap<String, HashSet<String>>>,
}

impl UidTrackingExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expectations whose records go stale after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            counts: ControllerExpectations::with_ttl(ttl),
            deleting: Mutex::new(HashMap::new()),
        }
    }

    /// Expect exactly `child_keys` to be deleted, replacing any previous set.
    pub fn expect_deletions(&self, key: &str, child_keys: &[String]) {
        let set: HashSet<String> = child_keys.iter().cloned().collect();
        let dels = set.len() as i64;
        lock(&self.deleting).insert(key.to_string(), set);
        self.counts.expect_deletions(key, dels);
    }

    /// Record that `child_key` is gone. Ignored unless it was expected.
    pub fn deletion_observed(&self, key: &str, child_key: &str) {
        let removed = lock(&self.deleting)
            .get_mut(key)
            .is_some_and(|set| set.remove(child_key));
        if removed {
            self.counts.lower_expectations(key, 0, 1);
        }
    }

    /// Expect `adds` creations, dropping any pending deletion set.
    pub fn expect_creations(&self, key: &str, adds: i64) {
        lock(&self.deleting).remove(key);
        self.counts.expect_creations(key, adds);
    }

    /// Overwrite the counters, dropping any pending deletion set.
    pub fn set_expectations(&self, key: &str, adds: i64, dels: i64) {
        lock(&self.deleting).remove(key);
        self.counts.set_expectations(key, adds, dels);
    }

    /// Add to the counters; the pending deletion set is kept.
    pub fn raise_expectations(&self, key: &str, add: i64, del: i64) {
        self.counts.raise_expectations(key, add, del);
    }

    /// Subtract from the counters; the pending deletion set is kept.
    pub fn lower_expectations(&self, key: &str, add: i64, del: i64) {
        self.counts.lower_expectations(key, add, del);
    }

    /// One expected creation showed up, or its create call failed.
    pub fn creation_observed(&self, key: &str) {
        self.counts.creation_observed(key);
    }

    /// Satisfied when stale, or when both the counters and the pending
    /// deletion set are empty. A stale record also drops its pending set.
    pub fn satisfied_expectations(&self, key: &str) -> bool {
        if self.counts.expired(key) {
            info!(key, "Expectations expired");
            lock(&self.deleting).remove(key);
            return true;
        }
        match self.counts.state(key) {
            RecordState::Pending => false,
            RecordState::Missing | RecordState::Fulfilled | RecordState::Expired => {
                self.pending_deletions(key).is_empty()
            }
        }
    }

    /// Forget `key` and its pending deletion set.
    pub fn delete_expectations(&self, key: &str) {
        lock(&self.deleting).remove(key);
        self.counts.delete_expectations(key);
    }

    /// Child keys still expected to disappear.
    pub fn pending_deletions(&self, key: &str) -> HashSet<String> {
        lock(&self.deleting).get(key).cloned().unwrap_or_default()
    }

    /// Current `(adds, dels)` for `key`.
    pub fn get(&self, key: &str) -> Option<(i64, i64)> {
        self.counts.get(key)
    }
}

//! Deduplicating, rate-limited work queue of fleet keys.
//!
//! # Guarantees
//!
//! - A key is handed to at most one worker at a time
//! - Re-adding a key that is waiting is a no-op
//! - Re-adding a key that is being processed marks it dirty; it is
//!   delivered once more after [`WorkQueue::done`]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, trace};

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default retry delay ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RateLimiter {
    /// Backoff of `base * 2^failures`, capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the next retry of `key`; counts as one more failure.
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &str) {
        lock(&self.failures).remove(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    limiter: RateLimiter,
}

/// Cloneable handle to a shared queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, RateLimiter::default())
    }

    /// Queue with a custom backoff schedule.
    pub fn with_rate_limiter(name: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                limiter,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `key`. Ignored after shutdown.
    pub fn add(&self, key: &str) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            trace!(queue = %self.inner.name, key, "Key in flight, marked dirty");
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.inner.state);
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished; a dirty key goes back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = lock(&self.inner.state);
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Enqueue `key` after `delay`.
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Enqueue `key` after its backoff delay.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.limiter.when(key);
        debug!(queue = %self.inner.name, key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    /// Failures recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Stop accepting keys and wake every waiting worker.
    pub fn shut_down(&self) {
        lock(&self.inner.state).shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called.
    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Deduplicating work queue with per-key exponential backoff.
//!
//! A key is held at most once, whether waiting or being processed. A key
//! added while a worker processes it is marked dirty and handed out again
//! once the worker calls [`WorkQueue::done`], so no update is lost and no
//! key is processed by two workers at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::metrics::SyncMetrics;

/// First retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Longest retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Delay before the `failures`-th retry: `base * 2^(failures - 1)`, capped
/// at `max`.
#[must_use]
pub fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1);
    base.saturating_mul(2_u32.saturating_pow(exponent)).min(max)
}

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
    metrics: SyncMetrics,
}

/// Work queue shared by the event pumps and the workers. Cheap to clone.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Creates a queue with the default backoff (100ms doubling to 5min).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Creates a queue with a custom backoff.
    #[must_use]
    pub fn with_backoff(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                base_delay,
                max_delay,
                metrics: SyncMetrics::new(),
            }),
        }
    }

    // The state is only mutated under the lock in small, panic-free steps.
    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_depth(&self, state: &State<K>) {
        self.inner
            .metrics
            .set_queue_depth(&self.inner.name, state.queue.len());
    }

    /// Adds a key. No-op if it is already waiting or the queue is shut down.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.publish_depth(&state);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds a key after its backoff delay, and counts the failure.
    pub fn add_rate_limited(&self, key: K) {
        let failures = {
            let mut state = self.state();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = backoff(self.inner.base_delay, self.inner.max_delay, failures);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the failure count of a key.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Number of failures counted for a key since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down
    /// and drained of waiting keys.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.publish_depth(&state);
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key as processed, requeueing it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.publish_depth(&state);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Returns true if no key is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting keys and wakes every waiter.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Returns true once [`WorkQueue::shut_down`] was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}

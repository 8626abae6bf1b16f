//! Rate-limited de-duplicating work queue
//!
//! - an item is queued at most once, however often it is added
//! - an item being processed is never handed to a second worker; adds during
//!   processing are replayed after [`WorkQueue::done`]
//! - [`WorkQueue::add_rate_limited`] delays by a per-item exponential backoff
//!   that [`WorkQueue::forget`] resets

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use route_forge_common::retry::RetryConfig;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Default for State<T> {
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

/// Work queue keyed by `T`
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: RetryConfig,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue using the default per-item backoff
    pub fn new() -> Arc<Self> {
        Self::with_limiter(RetryConfig::per_item())
    }

    /// Create a queue with a custom per-item backoff
    pub fn with_limiter(limiter: RetryConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            limiter,
        })
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its backoff delay, lengthening the next one
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = self.limiter.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`
    pub fn forget(&self, item: &T) {
        self.state.lock().failures.remove(item);
    }

    /// Number of rate-limited requeues of `item` since the last forget
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`, requeueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting items and release idle workers
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of items waiting to be processed
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no items are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicates_are_coalesced() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
    }

    #[tokio::test]
    async fn add_during_processing_is_replayed_after_done() {
        let q = WorkQueue::new();
        q.add("a");
        let item = q.get().await.unwrap();

        q.add("a");
        assert!(q.is_empty(), "in-flight item must not be handed out twice");

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let q: Arc<WorkQueue<&str>> = WorkQueue::new();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(worker.await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_then_rejects() {
        let q = WorkQueue::new();
        q.add("a");
        q.shutdown();
        q.add("b");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_waits_for_delay() {
        let q = WorkQueue::new();
        q.add_after("a", Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_backs_off_and_forget_resets() {
        let q = WorkQueue::new();
        q.add_rate_limited("a");
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 2);

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }
}

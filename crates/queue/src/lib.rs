//! Warden queue: deduplicating, rate-limited change queue.
//!
//! An item is in at most one of three places: waiting in the queue, being
//! processed by a worker, or parked in the delayed-retry heap. Adding an item
//! that is queued or processing only marks it dirty, so a key is never handed
//! to two workers at once and bursts of changes collapse into one pass.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub mod limiter;

pub use limiter::{controller_limiter, default_controller_limiter, BucketLimiter, ItemExponentialLimiter, MaxOfLimiter, RateLimiter, MAX_DELAY};

/// Entry of the delayed-retry heap. Ordered by ready time, then insertion.
#[derive(Debug)]
struct Delayed<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Delayed<T> {
    fn eq(&self, other: &Self) -> bool { self.ready_at == other.ready_at && self.seq == other.seq }
}
impl<T> Eq for Delayed<T> {}
impl<T> PartialOrd for Delayed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl<T> Ord for Delayed<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq)) }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    waiting: BinaryHeap<Reverse<Delayed<T>>>,
    /// Current ready time per delayed item; heap entries that disagree are stale.
    waiting_at: FxHashMap<T, Instant>,
    enqueued_at: FxHashMap<T, Instant>,
    started_at: FxHashMap<T, Instant>,
    seq: u64,
    shutting_down: bool,
}

pub struct ChangeQueue<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    drain: Notify,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T> ChangeQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                waiting: BinaryHeap::new(),
                waiting_at: FxHashMap::default(),
                enqueued_at: FxHashMap::default(),
                started_at: FxHashMap::default(),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            drain: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    /// Queue with the default controller rate limiter.
    pub fn with_default_limiter(name: impl Into<String>) -> Self { Self::new(name, default_controller_limiter()) }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Enqueue `item` unless it is already pending; ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down {
            debug!(queue = %self.name, ?item, "queue shutting down; add ignored");
            return;
        }
        metrics::counter!("queue_adds_total", "queue" => self.name.clone()).increment(1);
        if self.add_locked(&mut st, item) {
            self.notify.notify_one();
        }
    }

    /// Returns true when the item became available to `get`.
    fn add_locked(&self, st: &mut State<T>, item: T) -> bool {
        if st.dirty.contains(&item) {
            return false;
        }
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            return false;
        }
        st.enqueued_at.insert(item.clone(), Instant::now());
        st.queue.push_back(item);
        metrics::gauge!("queue_depth", "queue" => self.name.clone()).set(st.queue.len() as f64);
        true
    }

    /// Enqueue `item` once `delay` has elapsed. Repeated calls keep the earliest time.
    /// Delays beyond [`MAX_DELAY`] are clamped.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        metrics::counter!("queue_adds_total", "queue" => self.name.clone()).increment(1);
        let ready_at = Instant::now() + delay.min(MAX_DELAY);
        if let Some(existing) = st.waiting_at.get(&item) {
            if *existing <= ready_at {
                return;
            }
        }
        st.seq += 1;
        let seq = st.seq;
        st.waiting_at.insert(item.clone(), ready_at);
        st.waiting.push(Reverse(Delayed { ready_at, seq, item }));
        drop(st);
        self.notify.notify_one();
    }

    /// Enqueue after the rate limiter's delay for this item.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        metrics::counter!("queue_retries_total", "queue" => self.name.clone()).increment(1);
        self.add_after(item, delay);
    }

    /// Reset the failure history of `item` in the rate limiter.
    pub fn forget(&self, item: &T) { self.limiter.forget(item) }

    pub fn num_requeues(&self, item: &T) -> u32 { self.limiter.num_requeues(item) }

    /// Move delayed items whose time has come into the queue.
    fn promote_ready(&self, st: &mut State<T>) -> bool {
        let now = Instant::now();
        let mut promoted = false;
        while let Some(Reverse(head)) = st.waiting.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = st.waiting.pop() else { break };
            if st.waiting_at.get(&entry.item) != Some(&entry.ready_at) {
                continue;
            }
            st.waiting_at.remove(&entry.item);
            promoted |= self.add_locked(st, entry.item);
        }
        promoted
    }

    fn next_deadline(st: &State<T>) -> Option<Instant> { st.waiting.peek().map(|Reverse(d)| d.ready_at) }

    /// Wait for the next item and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down, empty and no item is still
    /// being processed.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let deadline = {
                let mut st = self.lock();
                if !st.shutting_down {
                    self.promote_ready(&mut st);
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let now = Instant::now();
                    if let Some(at) = st.enqueued_at.remove(&item) {
                        metrics::histogram!("queue_latency_ms", "queue" => self.name.clone()).record(now.duration_since(at).as_secs_f64() * 1000.0);
                    }
                    st.started_at.insert(item.clone(), now);
                    metrics::gauge!("queue_depth", "queue" => self.name.clone()).set(st.queue.len() as f64);
                    if !st.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down && st.processing.is_empty() {
                    return None;
                }
                if st.shutting_down { None } else { Self::next_deadline(&st) }
            };
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `item` after processing; a dirty item goes straight back in.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if let Some(at) = st.started_at.remove(item) {
            metrics::histogram!("queue_work_duration_ms", "queue" => self.name.clone()).record(at.elapsed().as_secs_f64() * 1000.0);
        }
        if st.dirty.contains(item) {
            st.enqueued_at.insert(item.clone(), Instant::now());
            st.queue.push_back(item.clone());
            metrics::gauge!("queue_depth", "queue" => self.name.clone()).set(st.queue.len() as f64);
            self.notify.notify_one();
        }
        if st.shutting_down {
            self.notify.notify_waiters();
            if st.queue.is_empty() && st.processing.is_empty() {
                self.drain.notify_waiters();
            }
        }
    }

    /// Stop accepting work and wake every blocked `get`. Delayed retries are
    /// discarded; queued, dirty and in-flight items still drain.
    pub fn shutdown(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let dropped = st.waiting_at.len();
        st.waiting.clear();
        st.waiting_at.clear();
        info!(queue = %self.name, queued = st.queue.len(), processing = st.processing.len(), dropped_retries = dropped, "queue shutting down");
        let drained = st.queue.is_empty() && st.processing.is_empty();
        drop(st);
        self.notify.notify_waiters();
        if drained {
            self.drain.notify_waiters();
        }
    }

    /// Resolves once the queue is shut down and fully drained.
    pub async fn drained(&self) {
        loop {
            let notified = self.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.shutting_down && st.queue.is_empty() && st.processing.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Items ready for `get` (excludes processing and delayed items).
    pub fn len(&self) -> usize { self.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn processing(&self) -> usize { self.lock().processing.len() }

    pub fn delayed(&self) -> usize { self.lock().waiting_at.len() }
}

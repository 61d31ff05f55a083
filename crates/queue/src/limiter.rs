//! Retry rate limiters.

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use warden_core::BackoffPolicy;

/// Longest delay any limiter hands out.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Decides how long an item waits before it is retried.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; records one more failure.
    fn when(&self, item: &T) -> Duration;
    /// Clear the failure history of `item`.
    fn forget(&self, item: &T);
    /// Failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

/// Per-item exponential backoff keyed by cumulative failure count.
pub struct ItemExponentialLimiter<T> {
    policy: BackoffPolicy,
    failures: Mutex<FxHashMap<T, u32>>,
}

impl<T> ItemExponentialLimiter<T> {
    pub fn new(policy: BackoffPolicy) -> Self { Self { policy, failures: Mutex::new(FxHashMap::default()) } }
}

impl<T: Eq + Hash + Clone + Send> RateLimiter<T> for ItemExponentialLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(item.clone()).or_insert(0);
        let delay = self.policy.delay(*n);
        *n = n.saturating_add(1);
        delay
    }

    fn forget(&self, item: &T) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by every item: `qps` refill, `burst` capacity.
///
/// A `qps` that is not a positive finite number leaves the bucket unlimited.
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps, burst, state: Mutex::new((burst, Instant::now())) }
    }
}

impl<T> RateLimiter<T> for BucketLimiter {
    fn when(&self, _item: &T) -> Duration {
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Duration::ZERO;
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let refill = now.saturating_duration_since(st.1).as_secs_f64() * self.qps;
        st.0 = (st.0 + refill).min(self.burst) - 1.0;
        st.1 = now;
        if st.0 >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-st.0 / self.qps).map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 { 0 }
}

/// Worst case of several limiters.
pub struct MaxOfLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self { Self { limiters } }
}

impl<T> RateLimiter<T> for MaxOfLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters.iter().map(|l| l.when(item)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for l in self.limiters.iter() {
            l.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(item)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff combined with an overall bucket.
pub fn controller_limiter<T>(per_item: BackoffPolicy, qps: f64, burst: u32) -> MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    MaxOfLimiter::new(vec![Box::new(ItemExponentialLimiter::new(per_item)), Box::new(BucketLimiter::new(qps, burst))])
}

/// 5ms doubling to 1000s per item, 10 qps with a burst of 100 overall.
pub fn default_controller_limiter<T>() -> MaxOfLimiter<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    controller_limiter(BackoffPolicy::default(), 10.0, 100)
}

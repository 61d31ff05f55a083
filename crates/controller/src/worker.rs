use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_core::{Object, ResourceKey};
use warden_queue::ChangeQueue;
use warden_store::WatchCache;

use crate::{ControllerError, Reconciler};

/// Pool of workers draining one controller's queue.
pub struct WorkerPool<K> {
    controller: String,
    queue: Arc<ChangeQueue<ResourceKey>>,
    cache: WatchCache<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    max_retries: u32,
}

impl<K: Object> WorkerPool<K> {
    pub fn new(
        controller: impl Into<String>,
        queue: Arc<ChangeQueue<ResourceKey>>,
        cache: WatchCache<K>,
        reconciler: Arc<dyn Reconciler<K>>,
        max_retries: u32,
    ) -> Self {
        Self { controller: controller.into(), queue, cache, reconciler, max_retries }
    }

    /// Block until the cache has synced.
    ///
    /// `Ok(false)` means `stop` fired first; waiting longer than `timeout`
    /// is an error.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken, timeout: Duration) -> Result<bool, ControllerError> {
        info!(controller = %self.controller, "waiting for caches to sync");
        match tokio::time::timeout(timeout, self.cache.wait_for_sync(stop)).await {
            Ok(true) => {
                info!(controller = %self.controller, objects = self.cache.len(), "caches synced");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(_) => Err(ControllerError::SyncTimeout { controller: self.controller.clone(), timeout }),
        }
    }

    /// Spawn `count` workers. Refuses to start before the cache has synced.
    pub fn spawn(&self, count: usize) -> Result<JoinSet<()>, ControllerError> {
        if !self.cache.has_synced() {
            return Err(ControllerError::NotSynced(self.controller.clone()));
        }
        let mut set = JoinSet::new();
        for id in 0..count {
            let worker = Worker {
                controller: self.controller.clone(),
                id,
                queue: Arc::clone(&self.queue),
                cache: self.cache.clone(),
                reconciler: Arc::clone(&self.reconciler),
                max_retries: self.max_retries,
            };
            set.spawn(worker.run());
        }
        Ok(set)
    }
}

struct Worker<K> {
    controller: String,
    id: usize,
    queue: Arc<ChangeQueue<ResourceKey>>,
    cache: WatchCache<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    max_retries: u32,
}

impl<K: Object> Worker<K> {
    async fn run(self) {
        debug!(controller = %self.controller, worker = self.id, "worker started");
        while self.process_next_item().await {}
        debug!(controller = %self.controller, worker = self.id, "worker exiting");
    }

    /// Returns false once the queue is shut down and drained.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        let item = InFlight { queue: &self.queue, key };
        let key = &item.key;
        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.reconciler.reconcile(key, &self.cache)).catch_unwind().await {
            Ok(res) => res,
            Err(panic) => Err(anyhow!("reconcile panicked: {}", panic_message(panic.as_ref()))),
        };
        let result = if outcome.is_ok() { "ok" } else { "error" };
        metrics::histogram!("reconcile_duration_ms", "controller" => self.controller.clone()).record(started.elapsed().as_secs_f64() * 1000.0);
        metrics::counter!("reconcile_total", "controller" => self.controller.clone(), "result" => result).increment(1);
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| self.handle_result(key, outcome))) {
            error!(controller = %self.controller, key = %key, panic = panic_message(panic.as_ref()), "retry scheduling panicked; key dropped");
        }
        true
    }

    fn handle_result(&self, key: &ResourceKey, outcome: anyhow::Result<()>) {
        let Err(err) = outcome else {
            debug!(controller = %self.controller, key = %key, "reconciled");
            self.queue.forget(key);
            return;
        };
        let retries = self.queue.num_requeues(key);
        if retries < self.max_retries {
            warn!(controller = %self.controller, key = %key, attempt = retries + 1, error = ?err, "reconcile failed; requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }
        metrics::counter!("reconcile_terminal_failures_total", "controller" => self.controller.clone()).increment(1);
        error!(controller = %self.controller, key = %key, retries, error = ?err, "dropping key out of the queue after exhausting retries");
        self.queue.forget(key);
    }
}

/// Releases the key back to the queue when dropped, unwinding included.
struct InFlight<'a> {
    queue: &'a ChangeQueue<ResourceKey>,
    key: ResourceKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) { self.queue.done(&self.key); }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use warden_core::{Object, ResourceKey};
use warden_kubehub::ListWatch;
use warden_queue::ChangeQueue;
use warden_store::WatchCache;

use crate::aggregator::SyncBarrier;
use crate::{ControllerConfig, ControllerError, EventDispatcher, Reconciler, WorkerPool};

/// Watch cache, change queue and worker pool wired together for one kind.
pub struct ResourceController<K> {
    name: String,
    cache: WatchCache<K>,
    queue: Arc<ChangeQueue<ResourceKey>>,
    pool: WorkerPool<K>,
    cfg: ControllerConfig,
    barrier: Option<SyncBarrier>,
}

impl<K: Object> ResourceController<K> {
    pub fn new(name: impl Into<String>, source: impl ListWatch<K>, reconciler: impl Reconciler<K>, cfg: ControllerConfig) -> Self {
        let name = name.into();
        let queue = Arc::new(ChangeQueue::new(name.clone(), cfg.limiter()));
        let cache = WatchCache::new(name.clone(), source, cfg.cache_config());
        cache.add_event_handler(Arc::new(EventDispatcher::new(name.clone(), Arc::clone(&queue))));
        let pool = WorkerPool::new(name.clone(), Arc::clone(&queue), cache.clone(), Arc::new(reconciler), cfg.max_retries);
        Self { name, cache, queue, pool, cfg, barrier: None }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Read-only view of the controller's cache, shared with its reconciler.
    pub fn cache(&self) -> &WatchCache<K> { &self.cache }

    pub fn queue(&self) -> &Arc<ChangeQueue<ResourceKey>> { &self.queue }

    pub fn config(&self) -> &ControllerConfig { &self.cfg }

    /// Report to `barrier` once the cache has synced.
    pub fn with_barrier(mut self, barrier: SyncBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Run until `stop` is cancelled.
    ///
    /// Workers start only after the cache has synced. On stop the queue
    /// drains: the call returns once in-flight reconciliations have finished.
    pub async fn run(self, workers: usize, stop: CancellationToken) -> Result<(), ControllerError> {
        let workers = if workers == 0 {
            warn!(controller = %self.name, "zero workers requested; using one");
            1
        } else {
            workers
        };
        info!(controller = %self.name, workers, "starting controller");
        let cache_stop = stop.child_token();
        let cache_task = self.cache.start(cache_stop.clone())?;

        let synced = match self.pool.wait_for_cache_sync(&stop, self.cfg.sync_timeout).await {
            Ok(synced) => synced,
            Err(e) => {
                self.queue.shutdown();
                cache_stop.cancel();
                let _ = cache_task.await;
                return Err(e);
            }
        };
        if !synced {
            info!(controller = %self.name, "stopped before caches synced");
            self.queue.shutdown();
            cache_stop.cancel();
            let _ = cache_task.await;
            return Ok(());
        }
        if let Some(barrier) = &self.barrier {
            barrier.arrive(&self.name);
        }

        let mut pool = self.pool.spawn(workers)?;
        info!(controller = %self.name, workers, "started workers");
        stop.cancelled().await;

        info!(controller = %self.name, "shutting down workers");
        self.queue.shutdown();
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.name, error = %e, "worker task failed");
            }
        }
        cache_stop.cancel();
        if let Err(e) = cache_task.await {
            error!(controller = %self.name, error = %e, "cache task failed");
        }
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }
}

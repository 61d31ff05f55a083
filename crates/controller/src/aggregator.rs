use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warden_core::Object;

use crate::{ControllerError, ResourceController};

#[derive(Debug, Clone, Copy, Default)]
struct Arrivals {
    expected: usize,
    arrived: usize,
}

/// Opens once every registered controller has synced its cache.
#[derive(Clone)]
pub struct SyncBarrier {
    tx: Arc<watch::Sender<Arrivals>>,
}

impl Default for SyncBarrier {
    fn default() -> Self { Self::new(0) }
}

impl SyncBarrier {
    pub fn new(expected: usize) -> Self {
        let (tx, _) = watch::channel(Arrivals { expected, arrived: 0 });
        Self { tx: Arc::new(tx) }
    }

    /// Register one more participant.
    pub fn expect_one(&self) { self.tx.send_modify(|a| a.expected += 1); }

    pub fn arrive(&self, who: &str) {
        self.tx.send_modify(|a| a.arrived += 1);
        let a = *self.tx.borrow();
        info!(controller = who, synced = a.arrived, expected = a.expected, "controller joined sync barrier");
    }

    pub fn is_open(&self) -> bool {
        let a = *self.tx.borrow();
        a.arrived >= a.expected
    }

    pub fn expected(&self) -> usize { self.tx.borrow().expected }

    pub fn arrived(&self) -> usize { self.tx.borrow().arrived }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting.
        let _ = rx.wait_for(|a| a.arrived >= a.expected).await;
    }
}

/// A controller the aggregator can run next to controllers of other kinds.
#[async_trait::async_trait]
pub trait ManagedController: Send + 'static {
    fn name(&self) -> &str;

    async fn run_managed(self: Box<Self>, workers: usize, stop: CancellationToken, barrier: SyncBarrier) -> Result<(), ControllerError>;
}

#[async_trait::async_trait]
impl<K: Object> ManagedController for ResourceController<K> {
    fn name(&self) -> &str { ResourceController::name(self) }

    async fn run_managed(self: Box<Self>, workers: usize, stop: CancellationToken, barrier: SyncBarrier) -> Result<(), ControllerError> {
        (*self).with_barrier(barrier).run(workers, stop).await
    }
}

/// Runs several controllers under one stop signal.
#[derive(Default)]
pub struct Aggregator {
    controllers: Vec<(Box<dyn ManagedController>, usize)>,
    barrier: SyncBarrier,
}

impl Aggregator {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, controller: impl ManagedController, workers: usize) -> &mut Self {
        self.barrier.expect_one();
        self.controllers.push((Box::new(controller), workers));
        self
    }

    pub fn with(mut self, controller: impl ManagedController, workers: usize) -> Self {
        self.add(controller, workers);
        self
    }

    pub fn len(&self) -> usize { self.controllers.len() }

    pub fn is_empty(&self) -> bool { self.controllers.is_empty() }

    /// Barrier that opens when every added controller has synced.
    pub fn barrier(&self) -> SyncBarrier { self.barrier.clone() }

    /// Run every controller until `stop` is cancelled and all have exited.
    ///
    /// A controller failure (cache sync timeout, cache start error) cancels
    /// `stop` for the others and is returned once they have shut down.
    pub async fn run(self, stop: CancellationToken) -> anyhow::Result<()> {
        info!(controllers = self.controllers.len(), "starting controllers");
        let mut set = JoinSet::new();
        for (controller, workers) in self.controllers {
            let name = controller.name().to_string();
            let stop = stop.clone();
            let barrier = self.barrier.clone();
            set.spawn(async move { (name, controller.run_managed(workers, stop, barrier).await) });
        }

        let mut failure: Option<anyhow::Error> = None;
        while let Some(joined) = set.join_next().await {
            let err = match joined {
                Ok((name, Ok(()))) => {
                    info!(controller = %name, "controller exited");
                    continue;
                }
                Ok((name, Err(e))) => {
                    error!(controller = %name, error = %e, "controller failed; stopping all controllers");
                    anyhow::Error::new(e).context(format!("controller {} failed", name))
                }
                Err(e) => {
                    error!(error = %e, "controller task aborted; stopping all controllers");
                    anyhow!("controller task aborted: {}", e)
                }
            };
            stop.cancel();
            failure.get_or_insert(err);
        }
        info!("all controllers stopped");
        failure.map_or(Ok(()), Err)
    }
}

//! Warden controllers: event dispatch, worker pools and the aggregator that
//! runs several resource controllers under one stop signal.
//!
//! A [`ResourceController`] owns a watch cache, a change queue and a worker
//! pool for one kind. Cache events become keys on the queue; workers hand each
//! key to the kind's [`Reconciler`], retrying failures with backoff up to a
//! fixed ceiling.

#![forbid(unsafe_code)]

use std::time::Duration;

use warden_store::CacheError;

mod aggregator;
mod config;
mod controller;
mod dispatcher;
mod reconcile;
mod worker;

pub use aggregator::{Aggregator, ManagedController, SyncBarrier};
pub use config::{ConfigError, ControllerConfig};
pub use controller::ResourceController;
pub use dispatcher::EventDispatcher;
pub use reconcile::{reconciler_fn, FnReconciler, Reconciler};
pub use worker::WorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("{controller}: caches did not sync within {timeout:?}")]
    SyncTimeout { controller: String, timeout: Duration },
    #[error("{0}: workers cannot start before the cache has synced")]
    NotSynced(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

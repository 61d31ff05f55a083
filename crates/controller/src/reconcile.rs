use std::future::Future;

use anyhow::Result;
use warden_core::{Object, ResourceKey};
use warden_store::WatchCache;

/// Per-kind business logic run for every changed key.
///
/// Never invoked concurrently for the same key, but may run in parallel for
/// different keys. Implementations should act on the current cache state
/// (events may have been coalesced) and be safe to repeat.
#[async_trait::async_trait]
pub trait Reconciler<K>: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey, cache: &WatchCache<K>) -> Result<()>;
}

/// Adapter turning an async closure into a [`Reconciler`].
pub struct FnReconciler<F>(F);

pub fn reconciler_fn<F>(f: F) -> FnReconciler<F> { FnReconciler(f) }

#[async_trait::async_trait]
impl<K, F, Fut> Reconciler<K> for FnReconciler<F>
where
    K: Object,
    F: Fn(ResourceKey, WatchCache<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn reconcile(&self, key: &ResourceKey, cache: &WatchCache<K>) -> Result<()> {
        (self.0)(key.clone(), cache.clone()).await
    }
}

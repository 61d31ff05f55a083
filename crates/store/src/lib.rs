//! Warden store: the watch cache.
//!
//! A [`WatchCache`] keeps a local mirror of one remote collection. It lists,
//! then watches from the listed resource version, and heals itself by
//! re-watching or relisting whenever the stream ends or fails. Every change to
//! the mirror is announced to registered handlers as a [`ResourceEvent`], in
//! the order the remote produced it.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::{BackoffPolicy, DeletedObject, Object, ResourceEvent, ResourceKey, Tombstone};
use warden_kubehub::{ListWatch, RawEvent, SourceError};

/// Observer of cache changes. Called on the cache task; keep it cheap.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_event(&self, event: &ResourceEvent<K>);
}

impl<K, F> ResourceEventHandler<K> for F
where
    F: Fn(&ResourceEvent<K>) + Send + Sync,
{
    fn on_event(&self, event: &ResourceEvent<K>) { self(event) }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("watch cache {0} already started")]
    AlreadyStarted(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    /// Re-announce every cached object as `Updated(o, o)` at this period.
    pub resync_period: Option<Duration>,
    /// Delay between failed list/watch attempts.
    pub backoff: BackoffPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_period: Some(Duration::from_secs(30)),
            backoff: BackoffPolicy::new(Duration::from_millis(800), Duration::from_secs(30)),
        }
    }
}

struct Shared<K> {
    name: String,
    source: Box<dyn ListWatch<K>>,
    cfg: CacheConfig,
    items: RwLock<FxHashMap<ResourceKey, Arc<K>>>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler<K>>>>,
    synced: watch::Sender<bool>,
    started: AtomicBool,
}

/// Cheap, cloneable handle to a self-healing local mirror.
pub struct WatchCache<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WatchCache<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

/// How the watch phase ended.
enum WatchExit {
    Stopped,
    /// The resource version expired; `delivered` as for `Failed`.
    Relist { delivered: bool },
    /// `delivered` is true when at least one event arrived before the failure.
    Failed { delivered: bool },
}

impl<K: Object> WatchCache<K> {
    pub fn new(name: impl Into<String>, source: impl ListWatch<K>, cfg: CacheConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                source: Box::new(source),
                cfg,
                items: RwLock::new(FxHashMap::default()),
                handlers: RwLock::new(Vec::new()),
                synced,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.shared.name }

    /// Register an observer. Handlers added after `start` miss earlier events.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler<K>>) {
        self.shared.handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    /// Spawn the list/watch loop; it runs until `stop` is cancelled.
    pub fn start(&self, stop: CancellationToken) -> Result<JoinHandle<()>, CacheError> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(CacheError::AlreadyStarted(self.shared.name.clone()));
        }
        let shared = Arc::clone(&self.shared);
        Ok(tokio::spawn(async move { shared.run(stop).await }))
    }

    /// True once the first listing has been replayed to all handlers.
    pub fn has_synced(&self) -> bool { *self.shared.synced.borrow() }

    /// Wait for the first sync. Returns `false` if `stop` fires first.
    pub async fn wait_for_sync(&self, stop: &CancellationToken) -> bool {
        let mut rx = self.shared.synced.subscribe();
        tokio::select! {
            _ = stop.cancelled() => self.has_synced(),
            res = rx.wait_for(|s| *s) => res.is_ok(),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.shared.read_items().get(key).cloned()
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        ResourceKey::parse(key).ok().and_then(|k| self.get(&k))
    }

    pub fn list(&self) -> Vec<Arc<K>> { self.shared.read_items().values().cloned().collect() }

    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.shared.read_items().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize { self.shared.read_items().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: Object> Shared<K> {
    fn read_items(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<ResourceKey, Arc<K>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, events: &[ResourceEvent<K>]) {
        if events.is_empty() {
            return;
        }
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for ev in events {
            metrics::counter!("cache_events_total", "cache" => self.name.clone(), "kind" => ev.kind()).increment(1);
            for h in handlers.iter() {
                h.on_event(ev);
            }
        }
    }

    async fn run(self: Arc<Self>, stop: CancellationToken) {
        let source = self.source.describe();
        info!(cache = %self.name, %source, "watch cache starting");
        let mut failures: u32 = 0;
        let mut watch_failures: u32 = 0;
        // Expiries in a row with nothing delivered in between.
        let mut expiries: u32 = 0;
        loop {
            if failures > 0 {
                let delay = self.cfg.backoff.delay(failures - 1);
                debug!(cache = %self.name, attempt = failures, delay_ms = delay.as_millis() as u64, "backing off before relist");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let listed = tokio::select! {
                _ = stop.cancelled() => break,
                res = self.source.list() => res,
            };
            let listing = match listed {
                Ok(l) => l,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    metrics::counter!("cache_list_errors_total", "cache" => self.name.clone()).increment(1);
                    warn!(cache = %self.name, error = %e, attempt = failures, "list failed");
                    continue;
                }
            };
            metrics::counter!("cache_relists_total", "cache" => self.name.clone()).increment(1);
            let count = listing.items.len();
            self.replace(listing.items);
            if !self.synced.send_replace(true) {
                info!(cache = %self.name, count, rv = %listing.resource_version, "cache synced");
            }
            match self.watch_from(listing.resource_version, &stop).await {
                WatchExit::Stopped => break,
                WatchExit::Relist { delivered } => {
                    watch_failures = 0;
                    expiries = if delivered { 1 } else { expiries.saturating_add(1) };
                    // Only the first expiry relists at once.
                    failures = expiries - 1;
                }
                WatchExit::Failed { delivered } => {
                    expiries = 0;
                    watch_failures = if delivered { 1 } else { watch_failures.saturating_add(1) };
                    failures = watch_failures;
                }
            }
        }
        info!(cache = %self.name, "watch cache stopped");
    }

    /// Watch (and re-watch on clean closes) until the stream needs a relist.
    async fn watch_from(&self, mut rv: String, stop: &CancellationToken) -> WatchExit {
        let mut delivered = false;
        let mut resync = self.cfg.resync_period.map(|p| {
            let mut iv = tokio::time::interval_at(Instant::now() + p, p);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        loop {
            let opened = tokio::select! {
                _ = stop.cancelled() => return WatchExit::Stopped,
                res = self.source.watch(&rv) => res,
            };
            let mut stream = match opened {
                Ok(s) => s,
                Err(e) if e.is_gone() => {
                    info!(cache = %self.name, rv = %rv, "resource version expired; relisting");
                    return WatchExit::Relist { delivered };
                }
                Err(e) => {
                    metrics::counter!("cache_watch_errors_total", "cache" => self.name.clone()).increment(1);
                    warn!(cache = %self.name, error = %e, "watch failed to open");
                    return WatchExit::Failed { delivered };
                }
            };
            debug!(cache = %self.name, rv = %rv, "watch opened");
            loop {
                let next = tokio::select! {
                    _ = stop.cancelled() => return WatchExit::Stopped,
                    _ = tick(&mut resync) => {
                        self.resync();
                        continue;
                    }
                    next = stream.next() => next,
                };
                match next {
                    None => {
                        debug!(cache = %self.name, rv = %rv, "watch stream closed; re-watching");
                        break;
                    }
                    Some(Ok(ev)) => {
                        delivered = true;
                        if let Some(next_rv) = self.apply(ev) {
                            rv = next_rv;
                        }
                    }
                    Some(Err(e)) if e.is_gone() => {
                        info!(cache = %self.name, rv = %rv, "watch expired; relisting");
                        return WatchExit::Relist { delivered };
                    }
                    Some(Err(SourceError::Decode(msg))) => {
                        metrics::counter!("cache_decode_errors_total", "cache" => self.name.clone()).increment(1);
                        warn!(cache = %self.name, error = %msg, "dropping undecodable watch event");
                    }
                    Some(Err(e)) => {
                        metrics::counter!("cache_watch_errors_total", "cache" => self.name.clone()).increment(1);
                        warn!(cache = %self.name, error = %e, "watch stream failed");
                        return WatchExit::Failed { delivered };
                    }
                }
            }
        }
    }

    /// Swap the mirror for a fresh listing and announce the difference.
    fn replace(&self, items: Vec<K>) {
        let mut events = Vec::with_capacity(items.len());
        {
            let mut guard = self.items.write().unwrap_or_else(PoisonError::into_inner);
            let mut previous = std::mem::take(&mut *guard);
            for obj in items {
                let key = match obj.key() {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(cache = %self.name, error = %e, "skipping listed object without identity");
                        continue;
                    }
                };
                let new = Arc::new(obj);
                let prior = previous.remove(&key);
                let old = guard.insert(key, Arc::clone(&new)).or(prior);
                events.push(match old {
                    Some(old) => ResourceEvent::Updated(old, new),
                    None => ResourceEvent::Added(new),
                });
            }
            let mut gone: Vec<_> = previous.into_iter().collect();
            gone.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, last_known) in gone {
                events.push(ResourceEvent::Deleted(DeletedObject::Tombstone(Tombstone { key, last_known })));
            }
            metrics::gauge!("cache_objects", "cache" => self.name.clone()).set(guard.len() as f64);
        }
        self.dispatch(&events);
    }

    /// Apply one watch event; returns the resource version to resume from.
    fn apply(&self, ev: RawEvent<K>) -> Option<String> {
        let (obj, deleted) = match ev {
            RawEvent::Bookmark(rv) => return Some(rv),
            RawEvent::Added(o) | RawEvent::Modified(o) => (o, false),
            RawEvent::Deleted(o) => (o, true),
        };
        let rv = obj.resource_version().map(str::to_string);
        let key = match obj.key() {
            Ok(k) => k,
            Err(e) => {
                metrics::counter!("cache_decode_errors_total", "cache" => self.name.clone()).increment(1);
                warn!(cache = %self.name, error = %e, "dropping watch event without identity");
                return rv;
            }
        };
        let obj = Arc::new(obj);
        let event = {
            let mut guard = self.items.write().unwrap_or_else(PoisonError::into_inner);
            let ev = if deleted {
                match guard.remove(&key) {
                    Some(_) => ResourceEvent::Deleted(DeletedObject::Live(obj)),
                    None => ResourceEvent::Deleted(DeletedObject::Tombstone(Tombstone { key, last_known: obj })),
                }
            } else {
                match guard.insert(key, Arc::clone(&obj)) {
                    Some(old) => ResourceEvent::Updated(old, obj),
                    None => ResourceEvent::Added(obj),
                }
            };
            metrics::gauge!("cache_objects", "cache" => self.name.clone()).set(guard.len() as f64);
            ev
        };
        self.dispatch(std::slice::from_ref(&event));
        rv
    }

    /// Re-announce the whole mirror unchanged.
    fn resync(&self) {
        let events: Vec<_> = self
            .read_items()
            .values()
            .map(|o| ResourceEvent::Updated(Arc::clone(o), Arc::clone(o)))
            .collect();
        debug!(cache = %self.name, count = events.len(), "resync");
        self.dispatch(&events);
    }
}

async fn tick(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

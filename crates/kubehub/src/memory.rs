//! In-process list/watch source.
//!
//! Keeps a resource-version history so watches opened from an older version
//! replay what they missed, exactly like the apiserver does until the history
//! is compacted. Failures, compaction and stream termination can be injected,
//! which makes it the fixture of choice for exercising cache self-healing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{channel::mpsc, StreamExt};
use tracing::debug;
use warden_core::Object;

use crate::{EventStream, ListWatch, Listing, RawEvent, SourceError};

type Sink<K> = mpsc::UnboundedSender<Result<RawEvent<K>, SourceError>>;

struct State<K> {
    objects: BTreeMap<String, K>,
    rv: u64,
    history: Vec<(u64, RawEvent<K>)>,
    compacted_at: u64,
    watchers: Vec<Sink<K>>,
    fail_lists: u32,
    fail_watches: u32,
    expire_watches: u32,
    list_calls: u32,
    watch_calls: u32,
}

/// Shared handle; clones observe and mutate the same collection.
pub struct MemorySource<K> {
    name: String,
    state: Arc<Mutex<State<K>>>,
}

impl<K> Clone for MemorySource<K> {
    fn clone(&self) -> Self { Self { name: self.name.clone(), state: Arc::clone(&self.state) } }
}

impl<K: Object + kube::Resource> MemorySource<K> {
    pub fn new(name: impl Into<String>) -> Self {
        let state = State {
            objects: BTreeMap::new(),
            rv: 0,
            history: Vec::new(),
            compacted_at: 0,
            watchers: Vec::new(),
            fail_lists: 0,
            fail_watches: 0,
            expire_watches: 0,
            list_calls: 0,
            watch_calls: 0,
        };
        Self { name: name.into(), state: Arc::new(Mutex::new(state)) }
    }

    pub fn with_objects(name: impl Into<String>, objects: impl IntoIterator<Item = K>) -> Self {
        let src = Self::new(name);
        for o in objects {
            src.apply(o);
        }
        src
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Create or replace an object. Returns the new resource version.
    pub fn apply(&self, mut obj: K) -> u64 {
        let Ok(key) = obj.key() else { return self.lock().rv };
        let mut st = self.lock();
        st.rv += 1;
        let rv = st.rv;
        obj.meta_mut().resource_version = Some(rv.to_string());
        let ev = if st.objects.insert(key.to_string(), obj.clone()).is_some() {
            RawEvent::Modified(obj)
        } else {
            RawEvent::Added(obj)
        };
        publish(&mut st, rv, ev);
        rv
    }

    /// Remove an object and announce it to live watches.
    pub fn delete(&self, key: &str) -> Option<K> {
        let mut st = self.lock();
        let mut obj = st.objects.remove(key)?;
        st.rv += 1;
        let rv = st.rv;
        obj.meta_mut().resource_version = Some(rv.to_string());
        publish(&mut st, rv, RawEvent::Deleted(obj.clone()));
        Some(obj)
    }

    /// Drop the change history: watches from any older version now get `Gone`.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.history.clear();
        st.compacted_at = st.rv;
    }

    /// End every open watch stream cleanly.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Deliver an error to every open watch and close it.
    pub fn fail_watches(&self, err: SourceError) {
        let mut st = self.lock();
        for w in st.watchers.drain(..) {
            let _ = w.unbounded_send(Err(err.clone()));
        }
    }

    /// Push a raw item to open watches without touching the collection.
    pub fn inject(&self, item: Result<RawEvent<K>, SourceError>) {
        let st = self.lock();
        for w in st.watchers.iter() {
            let _ = w.unbounded_send(item.clone());
        }
    }

    pub fn fail_next_lists(&self, n: u32) { self.lock().fail_lists = n; }
    pub fn fail_next_watches(&self, n: u32) { self.lock().fail_watches = n; }
    /// The next `n` watches are refused with `Gone` whatever version they ask for.
    pub fn expire_next_watches(&self, n: u32) { self.lock().expire_watches = n; }

    pub fn list_calls(&self) -> u32 { self.lock().list_calls }
    pub fn watch_calls(&self) -> u32 { self.lock().watch_calls }
    pub fn open_watches(&self) -> usize { self.lock().watchers.iter().filter(|w| !w.is_closed()).count() }
    pub fn resource_version(&self) -> u64 { self.lock().rv }
}

fn publish<K: Clone>(st: &mut State<K>, rv: u64, ev: RawEvent<K>) {
    st.watchers.retain(|w| w.unbounded_send(Ok(ev.clone())).is_ok());
    st.history.push((rv, ev));
}

#[async_trait::async_trait]
impl<K: Object + kube::Resource> ListWatch<K> for MemorySource<K> {
    fn describe(&self) -> String { format!("memory:{}", self.name) }

    async fn list(&self) -> Result<Listing<K>, SourceError> {
        let mut st = self.lock();
        st.list_calls += 1;
        if st.fail_lists > 0 {
            st.fail_lists -= 1;
            return Err(SourceError::Transport("injected list failure".into()));
        }
        Ok(Listing { items: st.objects.values().cloned().collect(), resource_version: st.rv.to_string() })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, SourceError> {
        let from: u64 = resource_version
            .parse()
            .map_err(|_| SourceError::Api { code: 400, message: format!("bad resource version {:?}", resource_version) })?;
        let mut st = self.lock();
        st.watch_calls += 1;
        if st.fail_watches > 0 {
            st.fail_watches -= 1;
            return Err(SourceError::Transport("injected watch failure".into()));
        }
        if st.expire_watches > 0 {
            st.expire_watches -= 1;
            return Err(SourceError::Gone(format!("{} expired", from)));
        }
        if from < st.compacted_at {
            return Err(SourceError::Gone(format!("{} < {}", from, st.compacted_at)));
        }
        let (tx, rx) = mpsc::unbounded();
        for (rv, ev) in st.history.iter() {
            if *rv > from {
                let _ = tx.unbounded_send(Ok(ev.clone()));
            }
        }
        st.watchers.push(tx);
        debug!(source = %self.name, from, "memory watch opened");
        Ok(rx.boxed())
    }
}

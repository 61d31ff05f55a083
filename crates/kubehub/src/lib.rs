//! Warden kubehub: the remote list/watch boundary and its kube-rs adapter.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Result};
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent},
    discovery::{Discovery, Scope},
    Client,
};
use serde::de::DeserializeOwned;
use tracing::debug;

pub mod memory;

pub use memory::MemorySource;

/// Snapshot returned by a full listing.
#[derive(Debug, Clone)]
pub struct Listing<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// One notification from a watch stream, before it reaches the cache.
#[derive(Debug, Clone)]
pub enum RawEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying only a newer resource version.
    Bookmark(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The requested resource version is no longer served; a relist is required.
    #[error("resource version expired: {0}")]
    Gone(String),
    /// A single payload could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl SourceError {
    pub fn is_gone(&self) -> bool { matches!(self, SourceError::Gone(_)) }
}

impl From<ErrorResponse> for SourceError {
    fn from(e: ErrorResponse) -> Self {
        if e.code == 410 {
            SourceError::Gone(e.message)
        } else {
            SourceError::Api { code: e.code, message: e.message }
        }
    }
}

impl From<kube::Error> for SourceError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => resp.into(),
            kube::Error::SerdeError(e) => SourceError::Decode(e.to_string()),
            other => SourceError::Transport(other.to_string()),
        }
    }
}

pub type EventStream<K> = BoxStream<'static, Result<RawEvent<K>, SourceError>>;

/// Remote collection that can be fully listed and incrementally watched.
#[async_trait::async_trait]
pub trait ListWatch<K>: Send + Sync + 'static {
    /// Human-readable description of the collection, for logs.
    fn describe(&self) -> String;

    async fn list(&self) -> Result<Listing<K>, SourceError>;

    /// Open a watch that delivers every change after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, SourceError>;
}

/// Server-side watch timeout; the apiserver caps it just under five minutes.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// [`ListWatch`] backed by a kube-rs [`Api`].
pub struct KubeListWatch<K> {
    api: Api<K>,
    name: String,
    list_params: ListParams,
    watch_params: WatchParams,
}

impl<K> KubeListWatch<K> {
    pub fn new(api: Api<K>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
            list_params: ListParams::default(),
            watch_params: WatchParams::default().timeout(WATCH_TIMEOUT_SECS),
        }
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.labels(selector);
        self.watch_params = self.watch_params.labels(selector);
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.fields(selector);
        self.watch_params = self.watch_params.fields(selector);
        self
    }
}

#[async_trait::async_trait]
impl<K> ListWatch<K> for KubeListWatch<K>
where
    K: Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn describe(&self) -> String { self.name.clone() }

    async fn list(&self) -> Result<Listing<K>, SourceError> {
        let list = self.api.list(&self.list_params).await?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(source = %self.name, count = list.items.len(), rv = %resource_version, "listed");
        Ok(Listing { items: list.items, resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, SourceError> {
        let stream = self.api.watch(&self.watch_params, resource_version).await?;
        Ok(stream.map(|ev| match ev {
            Ok(WatchEvent::Added(o)) => Ok(RawEvent::Added(o)),
            Ok(WatchEvent::Modified(o)) => Ok(RawEvent::Modified(o)),
            Ok(WatchEvent::Deleted(o)) => Ok(RawEvent::Deleted(o)),
            Ok(WatchEvent::Bookmark(b)) => Ok(RawEvent::Bookmark(b.metadata.resource_version)),
            Ok(WatchEvent::Error(resp)) => Err(SourceError::from(resp)),
            Err(e) => Err(SourceError::from(e)),
        }).boxed())
    }
}

/// Parse `v1/Kind` or `group/version/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Resolve a GVK key (incl. CRDs) through discovery into a dynamic list/watch source.
pub async fn dynamic_source(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<KubeListWatch<DynamicObject>> {
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api: Api<DynamicObject> = match namespace {
        Some(ns) if namespaced => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    };
    Ok(KubeListWatch::new(api, gvk_key))
}

//! Warden core types: resource identity, cache events and retry backoff.

#![forbid(unsafe_code)]

use std::fmt::Debug;

mod backoff;
mod event;
mod key;

pub use backoff::BackoffPolicy;
pub use event::{DeletedObject, ResourceEvent, Tombstone};
pub use key::{KeyError, ResourceKey};

pub mod prelude {
    pub use super::{BackoffPolicy, DeletedObject, KeyError, Object, ResourceEvent, ResourceKey, Tombstone};
}

/// A watched resource as the core sees it.
///
/// `same_state` is the equality contract used to suppress no-op updates: two
/// observations that compare equal never trigger a reconciliation.
pub trait Object: Clone + Debug + Send + Sync + 'static {
    /// Derive the stable identity (`namespace/name` or `name`).
    fn key(&self) -> Result<ResourceKey, KeyError>;
    fn resource_version(&self) -> Option<&str>;
    fn same_state(&self, other: &Self) -> bool;
}

impl<K> Object for K
where
    K: kube::Resource + Clone + Debug + PartialEq + Send + Sync + 'static,
{
    fn key(&self) -> Result<ResourceKey, KeyError> {
        let meta = self.meta();
        let name = meta.name.as_deref().ok_or(KeyError::MissingName)?;
        ResourceKey::new(meta.namespace.as_deref(), name)
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn same_state(&self, other: &Self) -> bool {
        self == other
    }
}

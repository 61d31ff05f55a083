use std::sync::Arc;

use crate::{KeyError, Object, ResourceKey};

/// Change notification emitted by a watch cache.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
    Added(Arc<K>),
    /// `(old, new)`
    Updated(Arc<K>, Arc<K>),
    Deleted(DeletedObject<K>),
}

/// Final state carried by a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    /// The cache held the object and observed its deletion directly.
    Live(Arc<K>),
    /// The object was no longer (or never) in the mirror when the deletion was
    /// observed, e.g. it disappeared between two listings.
    Tombstone(Tombstone<K>),
}

/// Identity plus last known state of an object deleted outside the mirror.
#[derive(Debug, Clone)]
pub struct Tombstone<K> {
    pub key: ResourceKey,
    pub last_known: Arc<K>,
}

impl<K> DeletedObject<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            DeletedObject::Live(o) => o,
            DeletedObject::Tombstone(t) => &t.last_known,
        }
    }

    pub fn is_tombstone(&self) -> bool { matches!(self, DeletedObject::Tombstone(_)) }
}

impl<K: Object> DeletedObject<K> {
    /// Key of the deleted object; tombstones yield the identity they recorded.
    pub fn key(&self) -> Result<ResourceKey, KeyError> {
        match self {
            DeletedObject::Live(o) => o.key(),
            DeletedObject::Tombstone(t) => Ok(t.key.clone()),
        }
    }
}

impl<K> ResourceEvent<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceEvent::Added(_) => "added",
            ResourceEvent::Updated(..) => "updated",
            ResourceEvent::Deleted(_) => "deleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;
    use kube::api::ObjectMeta;

    #[test]
    fn tombstone_key_matches_live_key() {
        let svc = Arc::new(Service {
            metadata: ObjectMeta { name: Some("svc-a".into()), namespace: Some("ns1".into()), ..Default::default() },
            ..Default::default()
        });
        let live = DeletedObject::Live(svc.clone());
        let key = svc.key().expect("key");
        let dead = DeletedObject::Tombstone(Tombstone { key: key.clone(), last_known: svc });
        assert_eq!(live.key().expect("key"), dead.key().expect("key"));
        assert!(dead.is_tombstone());
        assert!(!live.is_tombstone());
        assert_eq!(dead.object().metadata.name.as_deref(), Some("svc-a"));
    }
}

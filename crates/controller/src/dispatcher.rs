use std::sync::Arc;

use tracing::{debug, info, warn};
use warden_core::{DeletedObject, KeyError, Object, ResourceEvent, ResourceKey};
use warden_queue::ChangeQueue;
use warden_store::ResourceEventHandler;

/// Turns cache events into queue keys, dropping updates that change nothing.
pub struct EventDispatcher {
    controller: String,
    queue: Arc<ChangeQueue<ResourceKey>>,
}

impl EventDispatcher {
    pub fn new(controller: impl Into<String>, queue: Arc<ChangeQueue<ResourceKey>>) -> Self {
        Self { controller: controller.into(), queue }
    }

    /// Handle one event; returns the key that was enqueued, if any.
    pub fn handle<K: Object>(&self, event: &ResourceEvent<K>) -> Option<ResourceKey> {
        let key = match event {
            ResourceEvent::Added(obj) => {
                let key = self.derive(obj.key(), event)?;
                info!(controller = %self.controller, key = %key, "add obj");
                key
            }
            ResourceEvent::Updated(old, new) => {
                let key = self.derive(new.key(), event)?;
                if Arc::ptr_eq(old, new) || old.same_state(new) {
                    metrics::counter!("dispatch_noop_updates_total", "controller" => self.controller.clone()).increment(1);
                    debug!(controller = %self.controller, key = %key, "update without changes; skipped");
                    return None;
                }
                info!(controller = %self.controller, key = %key, old_rv = ?old.resource_version(), new_rv = ?new.resource_version(), "update obj");
                key
            }
            ResourceEvent::Deleted(deleted) => {
                let key = self.derive(deleted.key(), event)?;
                if let DeletedObject::Tombstone(_) = deleted {
                    debug!(controller = %self.controller, key = %key, "recovered deleted object from tombstone");
                }
                info!(controller = %self.controller, key = %key, "delete obj");
                key
            }
        };
        self.queue.add(key.clone());
        Some(key)
    }

    fn derive<K>(&self, key: Result<ResourceKey, KeyError>, event: &ResourceEvent<K>) -> Option<ResourceKey> {
        match key {
            Ok(k) => Some(k),
            Err(e) => {
                metrics::counter!("dispatch_dropped_total", "controller" => self.controller.clone()).increment(1);
                warn!(controller = %self.controller, kind = event.kind(), error = %e, "cannot derive key; event dropped");
                None
            }
        }
    }
}

impl<K: Object> ResourceEventHandler<K> for EventDispatcher {
    fn on_event(&self, event: &ResourceEvent<K>) {
        self.handle(event);
    }
}

//! Per-install cache: customer states, offerings and the current app user id.

use std::sync::Arc;

use entitle_core::{Clock, CustomerState};
use tracing::{debug, info, warn};

use super::memory_store::InMemoryStore;
use super::owner_key::IdentitySlot;
use super::snapshot_cache::SnapshotCache;
use super::traits::{CacheStats, KeyValueStore};

/// Everything the engine keeps on the device.
///
/// Customer states are durable. Offerings are held in memory only and are
/// rebuilt after a restart.
#[derive(Debug)]
pub struct DeviceCache {
    store: Arc<dyn KeyValueStore>,
    customer_states: SnapshotCache<CustomerState>,
    offerings: SnapshotCache<serde_json::Value>,
}

impl DeviceCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            customer_states: SnapshotCache::durable(store.clone(), clock.clone()),
            offerings: SnapshotCache::in_memory(clock),
            store,
        }
    }

    /// A cache backed by a fresh [`InMemoryStore`].
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(InMemoryStore::new()), clock)
    }

    pub fn customer_states(&self) -> &SnapshotCache<CustomerState> {
        &self.customer_states
    }

    pub fn offerings(&self) -> &SnapshotCache<serde_json::Value> {
        &self.offerings
    }

    /// The persisted current app user id.
    pub fn cached_app_user_id(&self) -> Option<String> {
        self.read_identity(IdentitySlot::Current)
    }

    /// The app user id stored by older installs, if still present.
    pub fn cached_legacy_app_user_id(&self) -> Option<String> {
        self.read_identity(IdentitySlot::Legacy)
    }

    pub fn cache_app_user_id(&self, app_user_id: &str) {
        if let Err(e) = self
            .store
            .persist(IdentitySlot::Current.key(), app_user_id.as_bytes())
        {
            warn!(app_user_id = %app_user_id, error = %e, "Failed to persist app user id");
        }
    }

    /// Drop everything cached for `old_app_user_id` and record
    /// `new_app_user_id` as current.
    ///
    /// The legacy id slot is removed too; once an identity transition has
    /// happened there is nothing left to migrate.
    pub fn clear_caches(&self, old_app_user_id: &str, new_app_user_id: &str) {
        self.customer_states.clear(old_app_user_id);
        self.offerings.clear(old_app_user_id);
        if let Err(e) = self.store.remove(IdentitySlot::Legacy.key()) {
            warn!(error = %e, "Failed to remove legacy app user id");
        }
        self.cache_app_user_id(new_app_user_id);
        info!(
            old_app_user_id = %old_app_user_id,
            new_app_user_id = %new_app_user_id,
            "Cleared caches for identity change"
        );
    }

    /// Combined statistics of both snapshot caches.
    pub fn stats(&self) -> CacheStats {
        self.customer_states.stats().merge(self.offerings.stats())
    }

    fn read_identity(&self, slot: IdentitySlot) -> Option<String> {
        match self.store.load(slot.key()) {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(id) if !id.trim().is_empty() => Some(id),
                Ok(_) => None,
                Err(e) => {
                    warn!(slot = ?slot, error = %e, "Ignoring non UTF-8 app user id");
                    None
                }
            },
            Ok(None) => {
                debug!(slot = ?slot, "No stored app user id");
                None
            }
            Err(e) => {
                warn!(slot = ?slot, error = %e, "Failed to load app user id");
                None
            }
        }
    }
}

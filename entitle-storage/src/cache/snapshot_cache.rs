//! Per-owner snapshot cache with refresh timestamps.
//!
//! Holds at most one snapshot per owner for a single [`CacheKind`], writing
//! through to an optional durable store. All operations are synchronous
//! critical sections under one mutex; the only I/O inside the lock is the
//! store itself.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use entitle_core::{Clock, StorageError, Timestamp};
use tracing::{debug, warn};

use super::freshness::{is_stale_at, CacheRead, Staleness};
use super::owner_key::OwnerScopedKey;
use super::traits::{CacheStats, CacheableSnapshot, KeyValueStore};

/// A cached snapshot and when it was last refreshed.
///
/// `last_updated` is `None` after [`SnapshotCache::clear_timestamp_only`]:
/// the value is still available as a fallback but always reads as stale.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub last_updated: Option<Timestamp>,
}

/// In-memory state for one owner.
#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    last_updated: Option<Timestamp>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            last_updated: None,
        }
    }
}

#[derive(Debug)]
struct State<T> {
    slots: HashMap<String, Slot<T>>,
    stats: CacheStats,
}

/// Staleness-aware cache of `T` snapshots keyed by owner.
pub struct SnapshotCache<T: CacheableSnapshot> {
    state: Mutex<State<T>>,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    _kind: PhantomData<T>,
}

impl<T: CacheableSnapshot> std::fmt::Debug for SnapshotCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("kind", &T::KIND)
            .field("durable", &self.store.is_some())
            .finish()
    }
}

impl<T: CacheableSnapshot> SnapshotCache<T> {
    /// A cache that writes through to `store`.
    pub fn durable(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::build(Some(store), clock)
    }

    /// A cache that lives only as long as the process.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::build(None, clock)
    }

    fn build(store: Option<Arc<dyn KeyValueStore>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                stats: CacheStats::default(),
            }),
            store,
            clock,
            _kind: PhantomData,
        }
    }

    /// Store `value` for `owner`, stamped with the current time.
    pub fn cache(&self, owner: &str, value: T) {
        let now = self.clock.now();
        let mut state = self.lock();
        if let Some(store) = &self.store {
            let written = value.encode_snapshot().and_then(|bytes| {
                store.persist(&OwnerScopedKey::value(owner, T::KIND).encode(), &bytes)?;
                store.persist(
                    &OwnerScopedKey::timestamp(owner, T::KIND).encode(),
                    &now.timestamp_millis().to_le_bytes(),
                )
            });
            if let Err(e) = written {
                warn!(owner = %owner, kind = %T::KIND, error = %e, "Failed to persist cache entry");
                state.stats.storage_errors += 1;
            }
        }
        let slot = state.slots.entry(owner.to_string()).or_default();
        slot.value = Some(value);
        slot.last_updated = Some(now);
        debug!(owner = %owner, kind = %T::KIND, "Cached snapshot");
    }

    /// The last cached value for `owner`. Never fetches.
    pub fn get(&self, owner: &str) -> Option<T> {
        let mut state = self.lock();
        let value = self.slot(&mut state, owner).and_then(|slot| slot.value.clone());
        Self::record(&mut state, value.is_some());
        value
    }

    /// The cached value together with its refresh timestamp.
    pub fn entry(&self, owner: &str) -> Option<CacheEntry<T>> {
        let mut state = self.lock();
        let slot = self.slot(&mut state, owner)?;
        slot.value.clone().map(|value| CacheEntry {
            value,
            last_updated: slot.last_updated,
        })
    }

    pub fn last_updated(&self, owner: &str) -> Option<Timestamp> {
        let mut state = self.lock();
        self.slot(&mut state, owner).and_then(|slot| slot.last_updated)
    }

    /// True when nothing is cached for `owner` or its entry is older than
    /// `max_age`.
    pub fn is_stale(&self, owner: &str, max_age: Duration) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        match self.slot(&mut state, owner) {
            Some(slot) => slot.value.is_none() || is_stale_at(slot.last_updated, now, max_age),
            None => true,
        }
    }

    /// Read with staleness evaluated under `staleness` for the lifecycle state
    /// and the environment of the cached snapshot.
    pub fn read(&self, owner: &str, staleness: &Staleness, is_app_backgrounded: bool) -> CacheRead<T> {
        let now = self.clock.now();
        let mut state = self.lock();
        let (value, last_updated) = match self.slot(&mut state, owner) {
            Some(slot) => (slot.value.clone(), slot.last_updated),
            None => (None, None),
        };
        let stale = match &value {
            Some(value) => {
                let max_age = staleness.threshold(is_app_backgrounded, value.is_sandbox());
                is_stale_at(last_updated, now, max_age)
            }
            None => true,
        };
        Self::record(&mut state, value.is_some());
        CacheRead::new(value, last_updated, stale)
    }

    /// Drop the value and its timestamp for `owner`.
    pub fn clear(&self, owner: &str) {
        let mut state = self.lock();
        let removed = match &self.store {
            Some(store) => store.remove_prefix(&OwnerScopedKey::kind_prefix(owner, T::KIND)),
            None => Ok(0),
        };
        match removed {
            Ok(_) => {
                state.slots.remove(owner);
            }
            Err(e) => {
                warn!(owner = %owner, kind = %T::KIND, error = %e, "Failed to remove cache entry");
                state.stats.storage_errors += 1;
                // An empty slot stops later reads from resurrecting the entry
                // the store failed to delete.
                state.slots.insert(owner.to_string(), Slot::default());
            }
        }
        debug!(owner = %owner, kind = %T::KIND, "Cleared cache entry");
    }

    /// Force `owner`'s entry stale while keeping the value as a fallback.
    pub fn clear_timestamp_only(&self, owner: &str) {
        let mut state = self.lock();
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&OwnerScopedKey::timestamp(owner, T::KIND).encode()) {
                warn!(owner = %owner, kind = %T::KIND, error = %e, "Failed to remove cache timestamp");
                state.stats.storage_errors += 1;
            }
        }
        if let Some(slot) = self.slot(&mut state, owner) {
            slot.last_updated = None;
        }
    }

    /// Mark an existing entry as refreshed now without replacing its value.
    ///
    /// Returns false when nothing is cached for `owner`.
    pub fn touch(&self, owner: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        match self.slot(&mut state, owner) {
            Some(slot) if slot.value.is_some() => {
                slot.last_updated = Some(now);
                // The durable timestamp is left alone: a crash mid-fetch
                // should leave the entry stale on the next launch.
                true
            }
            _ => false,
        }
    }

    /// Number of owners with an in-memory slot, empty ones included.
    pub fn tracked_owners(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entry_count: state.slots.values().filter(|s| s.value.is_some()).count() as u64,
            ..state.stats
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(state: &mut State<T>, hit: bool) {
        if hit {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
    }

    /// The slot for `owner`, loading it from the store on first access.
    ///
    /// Owners with nothing in memory or in the store get no slot, so misses
    /// leave no trace.
    fn slot<'a>(&self, state: &'a mut State<T>, owner: &str) -> Option<&'a mut Slot<T>> {
        if !state.slots.contains_key(owner) {
            let store = self.store.as_ref()?;
            let loaded = match Self::load(store.as_ref(), owner) {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(owner = %owner, kind = %T::KIND, error = %e, "Discarding unreadable cache entry");
                    state.stats.storage_errors += 1;
                    return None;
                }
            };
            if loaded.value.is_none() && loaded.last_updated.is_none() {
                return None;
            }
            state.slots.insert(owner.to_string(), loaded);
        }
        state.slots.get_mut(owner)
    }

    fn load(store: &dyn KeyValueStore, owner: &str) -> Result<Slot<T>, StorageError> {
        let value = match store.load(&OwnerScopedKey::value(owner, T::KIND).encode())? {
            Some(bytes) => Some(T::decode_snapshot(&bytes)?),
            None => None,
        };
        let last_updated = match store.load(&OwnerScopedKey::timestamp(owner, T::KIND).encode())? {
            Some(bytes) => Some(decode_timestamp(&bytes)?),
            None => None,
        };
        Ok(Slot {
            value,
            last_updated,
        })
    }
}

fn decode_timestamp(bytes: &[u8]) -> Result<Timestamp, StorageError> {
    let millis: [u8; 8] = bytes.try_into().map_err(|_| StorageError::Deserialization {
        kind: "timestamp".to_string(),
        reason: format!("expected 8 bytes, got {}", bytes.len()),
    })?;
    chrono::DateTime::from_timestamp_millis(i64::from_le_bytes(millis)).ok_or_else(|| {
        StorageError::Deserialization {
            kind: "timestamp".to_string(),
            reason: "timestamp out of range".to_string(),
        }
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_store::InMemoryStore;
    use crate::cache::owner_key::CacheKind;
    use chrono::{TimeZone, Utc};
    use entitle_core::{CustomerState, CustomerStatePayload, EntitlementRecord, ManualClock};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    fn state(owner: &str) -> CustomerState {
        CustomerState::new(owner, Utc::now(), CustomerStatePayload::default())
    }

    fn durable(store: &Arc<InMemoryStore>, clock: &ManualClock) -> SnapshotCache<CustomerState> {
        SnapshotCache::durable(store.clone(), Arc::new(clock.clone()))
    }

    #[test]
    fn test_cache_then_get() {
        let clock = clock();
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock.clone()));
        assert!(cache.get("u1").is_none());

        cache.cache("u1", state("u1"));
        assert_eq!(cache.get("u1").unwrap().app_user_id, "u1");
        assert_eq!(cache.last_updated("u1"), Some(clock.now()));
    }

    #[test]
    fn test_stale_after_duration() {
        let clock = clock();
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock.clone()));
        cache.cache("u1", state("u1"));

        assert!(!cache.is_stale("u1", Duration::from_secs(60)));
        clock.advance(Duration::from_secs(60));
        assert!(!cache.is_stale("u1", Duration::from_secs(60)));
        clock.advance(Duration::from_millis(1));
        assert!(cache.is_stale("u1", Duration::from_secs(60)));
    }

    #[test]
    fn test_missing_entry_is_stale() {
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock()));
        assert!(cache.is_stale("nobody", Duration::from_secs(3600)));
    }

    #[test]
    fn test_clear_resets_value_and_timestamp() {
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock()));
        cache.cache("u1", state("u1"));
        cache.clear("u1");
        assert!(cache.get("u1").is_none());
        assert!(cache.last_updated("u1").is_none());
        assert!(cache.is_stale("u1", Duration::from_secs(3600)));
    }

    #[test]
    fn test_clear_timestamp_only_keeps_value() {
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock()));
        cache.cache("u1", state("u1"));
        cache.clear_timestamp_only("u1");

        assert!(cache.get("u1").is_some());
        assert!(cache.is_stale("u1", Duration::from_secs(3600)));
        let entry = cache.entry("u1").unwrap();
        assert!(entry.last_updated.is_none());
    }

    #[test]
    fn test_touch_refreshes_existing_only() {
        let clock = clock();
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock.clone()));
        assert!(!cache.touch("u1"));

        cache.cache("u1", state("u1"));
        clock.advance(Duration::from_secs(600));
        assert!(cache.is_stale("u1", Duration::from_secs(300)));
        assert!(cache.touch("u1"));
        assert!(!cache.is_stale("u1", Duration::from_secs(300)));
    }

    #[test]
    fn test_read_reports_staleness() {
        let clock = clock();
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock.clone()));
        let staleness = Staleness::new(Duration::from_secs(300), Duration::from_secs(3600));
        cache.cache("u1", state("u1"));

        clock.advance(Duration::from_secs(301));
        assert!(cache.read("u1", &staleness, false).is_stale());
        assert!(!cache.read("u1", &staleness, true).is_stale());
        assert!(cache.read("u1", &staleness, true).is_fresh_hit());
    }

    #[test]
    fn test_owners_are_isolated() {
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock()));
        cache.cache("a", state("a"));
        assert!(cache.get("b").is_none());
        cache.clear("b");
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn test_durable_entries_survive_new_cache() {
        let store = Arc::new(InMemoryStore::new());
        let clock = clock();
        durable(&store, &clock).cache("u1", state("u1"));

        let reopened = durable(&store, &clock);
        let entry = reopened.entry("u1").unwrap();
        assert_eq!(entry.value.app_user_id, "u1");
        assert_eq!(entry.last_updated, Some(clock.now()));
    }

    #[test]
    fn test_durable_clear_removes_keys() {
        let store = Arc::new(InMemoryStore::new());
        let clock = clock();
        let cache = durable(&store, &clock);
        cache.cache("u1", state("u1"));
        assert_eq!(store.len(), 2);

        cache.clear("u1");
        assert!(store.is_empty());
        assert!(durable(&store, &clock).get("u1").is_none());
    }

    #[test]
    fn test_durable_clear_timestamp_only() {
        let store = Arc::new(InMemoryStore::new());
        let clock = clock();
        let cache = durable(&store, &clock);
        cache.cache("u1", state("u1"));
        cache.clear_timestamp_only("u1");

        let reopened = durable(&store, &clock);
        assert!(reopened.get("u1").is_some());
        assert!(reopened.is_stale("u1", Duration::from_secs(3600)));
    }

    #[test]
    fn test_persistence_failure_is_swallowed() {
        let store = Arc::new(InMemoryStore::new());
        store.set_failing(true);
        let cache = durable(&store, &clock());

        // Write fails on disk but memory still serves it.
        cache.cache("u1", state("u1"));
        assert!(cache.get("u1").is_some());
        assert!(cache.stats().storage_errors >= 1);
    }

    #[test]
    fn test_unreadable_entry_is_a_miss() {
        let store = Arc::new(InMemoryStore::new());
        store
            .persist(&OwnerScopedKey::value("u1", CacheKind::CustomerState).encode(), b"garbage")
            .unwrap();
        let cache = durable(&store, &clock());
        assert!(cache.get("u1").is_none());
        assert_eq!(cache.stats().storage_errors, 1);
    }

    #[test]
    fn test_incompatible_schema_is_a_miss() {
        let store = Arc::new(InMemoryStore::new());
        let mut old = state("u1");
        old.schema_version = "1".to_string();
        store
            .persist(
                &OwnerScopedKey::value("u1", CacheKind::CustomerState).encode(),
                &old.encode().unwrap(),
            )
            .unwrap();
        let cache = durable(&store, &clock());
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn test_misses_and_clears_leave_no_slots() {
        let store = Arc::new(InMemoryStore::new());
        let cache = durable(&store, &clock());
        for owner in ["a", "b", "c"] {
            assert!(cache.get(owner).is_none());
            assert!(cache.is_stale(owner, Duration::from_secs(60)));
            assert!(!cache.touch(owner));
        }
        assert_eq!(cache.tracked_owners(), 0);

        cache.cache("a", state("a"));
        assert_eq!(cache.tracked_owners(), 1);
        cache.clear("a");
        assert_eq!(cache.tracked_owners(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_clear_keeps_entry_hidden() {
        let store = Arc::new(InMemoryStore::new());
        let cache = durable(&store, &clock());
        cache.cache("u1", state("u1"));

        store.set_failing(true);
        cache.clear("u1");
        store.set_failing(false);

        assert!(cache.get("u1").is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_clear_keeps_other_kinds_of_same_owner() {
        let store = Arc::new(InMemoryStore::new());
        let clock = clock();
        let states = durable(&store, &clock);
        let offerings: SnapshotCache<serde_json::Value> =
            SnapshotCache::durable(store.clone(), Arc::new(clock.clone()));
        states.cache("u1", state("u1"));
        offerings.cache("u1", serde_json::json!({"current": "default"}));

        states.clear("u1");

        assert_eq!(store.len(), 2);
        assert!(offerings.get("u1").is_some());
    }

    #[test]
    fn test_sandbox_snapshot_uses_sandbox_threshold() {
        let clock = clock();
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock.clone()));
        let staleness = Staleness::new(Duration::from_secs(300), Duration::from_secs(90_000))
            .with_sandbox(Duration::from_secs(300));
        let mut payload = CustomerStatePayload::default();
        payload.entitlements.insert(
            "pro".to_string(),
            EntitlementRecord {
                product_identifier: "monthly".to_string(),
                expires_at: None,
                purchased_at: Utc::now(),
                is_sandbox: true,
                period_type: Default::default(),
                store: Default::default(),
            },
        );
        cache.cache("sandbox", CustomerState::new("sandbox", Utc::now(), payload));
        cache.cache("production", state("production"));

        clock.advance(Duration::from_secs(301));

        assert!(cache.read("sandbox", &staleness, true).is_stale());
        assert!(!cache.read("production", &staleness, true).is_stale());
    }

    #[test]
    fn test_stats_count_hits_and_misses() {
        let cache: SnapshotCache<CustomerState> = SnapshotCache::in_memory(Arc::new(clock()));
        cache.get("u1");
        cache.cache("u1", state("u1"));
        cache.get("u1");
        cache.get("u1");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[test]
    fn test_decode_timestamp_rejects_short_input() {
        assert!(decode_timestamp(&[1, 2, 3]).is_err());
    }
}

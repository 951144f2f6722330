//! Entitle Storage - Staleness-Aware Cache
//!
//! Per-owner snapshot caches with explicit staleness, backed by a durable
//! key-value store. Persistence failures are logged and degrade to cache
//! misses; nothing in this crate returns an error to synchronizer callers.

pub mod cache;

pub use cache::{
    CacheEntry, CacheKind, CacheRead, CacheStats, CacheableSnapshot, DeviceCache, EntrySlot,
    IdentitySlot, InMemoryStore, KeyValueStore, LmdbStore, LmdbStoreError, OwnerScopedKey,
    SnapshotCache, Staleness,
};

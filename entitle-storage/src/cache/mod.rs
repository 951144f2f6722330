//! Cache layer with explicit staleness and per-owner isolation.
//!
//! # Staleness
//!
//! Every cached snapshot carries the instant it was last refreshed. Reads
//! return a [`CacheRead<T>`] that says whether the entry is stale under the
//! caller's [`Staleness`] policy, so the caller decides between serving it and
//! refetching. The threshold differs when the app is backgrounded.
//!
//! # Owner Isolation
//!
//! Durable keys are built only through [`OwnerScopedKey`], which requires the
//! owning app user id. A lookup for one owner cannot read another owner's
//! entry.
//!
//! # Example
//!
//! ```ignore
//! let cache = DeviceCache::new(Arc::new(LmdbStore::open(dir, 64)?), clock);
//! cache.customer_states().cache("u1", state);
//!
//! let read = cache
//!     .customer_states()
//!     .read("u1", &Staleness::from_config(&config), false);
//! if read.is_stale() {
//!     // refetch, optionally serving read.value() meanwhile
//! }
//! ```

pub mod device_cache;
pub mod freshness;
pub mod lmdb_store;
pub mod memory_store;
pub mod owner_key;
pub mod snapshot_cache;
pub mod traits;

pub use device_cache::DeviceCache;
pub use freshness::{CacheRead, Staleness};
pub use lmdb_store::{LmdbStore, LmdbStoreError};
pub use memory_store::InMemoryStore;
pub use owner_key::{CacheKind, EntrySlot, IdentitySlot, OwnerScopedKey};
pub use snapshot_cache::{CacheEntry, SnapshotCache};
pub use traits::{CacheStats, CacheableSnapshot, KeyValueStore};

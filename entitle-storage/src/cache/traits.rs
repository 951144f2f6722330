//! Durable store trait and cacheable snapshot marker.

use super::owner_key::CacheKind;
use entitle_core::{CustomerState, StorageError};
use std::fmt;

/// Durable per-install key-value storage.
///
/// Calls are synchronous: cache bookkeeping never suspends, so an
/// implementation must not block on anything but its own I/O.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Write `bytes` under `key`, replacing any previous value.
    fn persist(&self, key: &[u8], bytes: &[u8]) -> Result<(), StorageError>;

    /// Read the bytes stored under `key`.
    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete `key`. Returns whether it existed.
    fn remove(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    fn remove_prefix(&self, prefix: &[u8]) -> Result<u64, StorageError>;
}

/// Types that can be held by a [`SnapshotCache`](super::SnapshotCache).
///
/// - `KIND` must be the same for every instance
/// - `encode_snapshot`/`decode_snapshot` define the durable byte format
/// - `is_sandbox` selects the sandbox staleness threshold
pub trait CacheableSnapshot: Clone + Send + Sync + 'static {
    const KIND: CacheKind;

    fn encode_snapshot(&self) -> Result<Vec<u8>, StorageError>;

    fn decode_snapshot(bytes: &[u8]) -> Result<Self, StorageError>;

    fn is_sandbox(&self) -> bool {
        false
    }
}

impl CacheableSnapshot for CustomerState {
    const KIND: CacheKind = CacheKind::CustomerState;

    fn encode_snapshot(&self) -> Result<Vec<u8>, StorageError> {
        self.encode().map_err(|e| StorageError::Serialization {
            kind: Self::KIND.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode_snapshot(bytes: &[u8]) -> Result<Self, StorageError> {
        CustomerState::decode(bytes).map_err(|e| StorageError::Deserialization {
            kind: Self::KIND.to_string(),
            reason: e.to_string(),
        })
    }

    fn is_sandbox(&self) -> bool {
        CustomerState::is_sandbox(self)
    }
}

/// Offerings are opaque to the engine and cached as raw JSON.
impl CacheableSnapshot for serde_json::Value {
    const KIND: CacheKind = CacheKind::Offerings;

    fn encode_snapshot(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization {
            kind: Self::KIND.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode_snapshot(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Deserialization {
            kind: Self::KIND.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a value, stale or not.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Owners currently holding a value.
    pub entry_count: u64,
    /// Persistence failures that were swallowed.
    pub storage_errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Sum of two stats snapshots.
    pub fn merge(self, other: CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            entry_count: self.entry_count + other.entry_count,
            storage_errors: self.storage_errors + other.storage_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_cache_stats_merge() {
        let a = CacheStats {
            hits: 1,
            misses: 2,
            entry_count: 3,
            storage_errors: 4,
        };
        let merged = a.merge(a);
        assert_eq!(merged.hits, 2);
        assert_eq!(merged.storage_errors, 8);
    }

    #[test]
    fn test_snapshot_kinds() {
        assert_eq!(CustomerState::KIND, CacheKind::CustomerState);
        assert_eq!(<serde_json::Value as CacheableSnapshot>::KIND, CacheKind::Offerings);
    }

    #[test]
    fn test_offerings_snapshot_codec() {
        let value = serde_json::json!({"current_offering_id": "default", "offerings": []});
        let bytes = value.encode_snapshot().unwrap();
        assert_eq!(serde_json::Value::decode_snapshot(&bytes).unwrap(), value);
        assert!(serde_json::Value::decode_snapshot(b"{").is_err());
    }

    #[test]
    fn test_customer_state_decode_error_is_storage_error() {
        let err = CustomerState::decode_snapshot(b"{}").unwrap_err();
        assert!(matches!(err, StorageError::Deserialization { .. }));
    }
}

//! In-memory key-value store.

use super::traits::KeyValueStore;
use entitle_core::StorageError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A process-local [`KeyValueStore`].
///
/// Used when no durable location is configured and in tests, where
/// [`InMemoryStore::set_failing`] simulates a broken disk.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                reason: "simulated store failure".to_string(),
            });
        }
        self.entries.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl KeyValueStore for InMemoryStore {
    fn persist(&self, key: &[u8], bytes: &[u8]) -> Result<(), StorageError> {
        self.entries()?.insert(key.to_vec(), bytes.to_vec());
        Ok(())
    }

    fn load(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn remove_prefix(&self, prefix: &[u8]) -> Result<u64, StorageError> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

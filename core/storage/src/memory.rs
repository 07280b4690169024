//! In-memory key-value store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::provider::{validate_key, KeyValueStore};
use deferq_common::{Error, Result};

/// In-memory key-value store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. An optional byte quota and a write-failure switch
/// let tests exercise storage-full and storage-unavailable paths.
pub struct MemoryStore {
    storage: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    quota_bytes: Option<usize>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty memory store without a quota.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            quota_bytes: None,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Create a memory store that rejects writes pushing the total stored
    /// size above `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// Make every subsequent `put`/`remove` fail with `StorageWrite`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Vec<u8>>>> {
        self.storage
            .read()
            .map_err(|_| Error::Storage("Memory store lock poisoned".to_string()))
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<u8>>>> {
        self.storage
            .write()
            .map_err(|_| Error::StorageWrite("Memory store lock poisoned".to_string()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::StorageWrite("Memory store is unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.read_lock()?.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;

        let mut storage = self.write_lock()?;
        if let Some(quota) = self.quota_bytes {
            let others: usize = storage
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if others + value.len() > quota {
                return Err(Error::StorageWrite(format!(
                    "Quota exceeded: {} of {} bytes",
                    others + value.len(),
                    quota
                )));
            }
        }

        storage.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.check_writable()?;
        self.write_lock()?.remove(key);
        Ok(())
    }
}

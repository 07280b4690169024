//! Durable key-value store trait definition.

use async_trait::async_trait;

use deferq_common::{Error, Result};

/// Durable local key-value storage.
///
/// Values are opaque byte blobs; callers own the encoding. A successful
/// `put` must survive a process restart. Implementations handle their own
/// locking so a single store can be shared behind an `Arc`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the backend name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` when nothing has been stored under the key yet.
    ///
    /// # Errors
    /// - Invalid key
    /// - Backend read failure
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`.
    ///
    /// # Postconditions
    /// - Either the new value is fully stored or the previous value is intact
    ///
    /// # Errors
    /// - `Error::StorageWrite` when the backend is unavailable or full
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove the value stored under `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    /// - `Error::StorageWrite` when the backend is unavailable
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Validate a storage key.
///
/// Keys map onto file names for directory-backed stores, so they are
/// restricted to ASCII alphanumerics, `.`, `_` and `-`, and may not start
/// with a dot.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Storage key cannot be empty".to_string()));
    }
    if key.starts_with('.') {
        return Err(Error::InvalidInput(format!(
            "Storage key cannot start with '.': {}",
            key
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::InvalidInput(format!(
            "Storage key contains invalid characters: {}",
            key
        )));
    }
    Ok(())
}

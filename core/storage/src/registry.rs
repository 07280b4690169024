//! Store registry for resolving a backend by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::KeyValueStore;
use deferq_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn KeyValueStore>> + Send + Sync>;

/// Registry for key-value store factories.
///
/// Lets configuration pick a backend by name (`"local"`, `"memory"`, ...)
/// together with a backend-specific JSON configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not registered
    /// - Configuration invalid for the store
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn KeyValueStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!(
                "Store '{}' is not registered (available: {})",
                name,
                self.stores().join(", ")
            ))
        })?;
        factory(config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in stores.
///
/// - `memory`: optional `{"quota_bytes": n}`
/// - `local`: requires `{"root": "/path/to/dir"}`
pub fn create_default_registry() -> Result<StoreRegistry> {
    let mut registry = StoreRegistry::new();

    registry.register(
        "memory",
        Box::new(|config| {
            let store = match config.get("quota_bytes").and_then(Value::as_u64) {
                Some(quota) => crate::memory::MemoryStore::with_quota(quota as usize),
                None => crate::memory::MemoryStore::new(),
            };
            Ok(Arc::new(store))
        }),
    )?;

    registry.register(
        "local",
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidInput("Local store requires 'root' path".to_string()))?;
            Ok(Arc::new(crate::local::LocalStore::new(root)?))
        }),
    )?;

    Ok(registry)
}

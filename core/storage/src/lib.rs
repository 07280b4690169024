//! Durable key-value storage for Deferq.
//!
//! This module provides a trait-based interface over local durable
//! storage (a directory on disk, or memory for tests) and a registry for
//! resolving a backend by name from configuration.
//!
//! # Design Principles
//! - Opaque values: the store never interprets what it holds
//! - Async operations: all I/O operations are async
//! - Whole-value writes: a `put` replaces a key atomically
//! - Unified error semantics: write failures surface as `Error::StorageWrite`

pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use provider::{validate_key, KeyValueStore};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};

//! Common utilities and types shared across Deferq modules.
//!
//! This module provides the error taxonomy and identifier types used by
//! the storage backends, the sync engine and the CLI.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::ActionId;

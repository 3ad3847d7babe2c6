//! Store backends for Keel.
//!
//! Provides the in-memory and file-backed implementations of the store
//! traits in `keel_core::store`, plus output publishing.

pub mod error;
pub mod file;
pub mod memory;
pub mod publish;

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use publish::{PublishReport, entries_for, publish, publish_node};

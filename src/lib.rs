//! Backblaze B2 storage backend with resumable, token-based listing.
//!
//! [`b2cs::B2Storage`] implements the [`storage::Storage`] contract on top of
//! a [`remote::RemoteClient`]. Backends are created by name through an
//! explicit [`registry::BackendRegistry`].

pub mod b2cs;
pub mod config;
pub mod cursor_cache;
pub mod error;
pub mod pagination;
pub mod registry;
pub mod remote;
pub mod storage;

pub use error::{ErrorKind, StorageError, StorageResult};
pub use registry::{BackendFactory, BackendRegistry};
pub use storage::{ListRefs, ListRefsItem, Storage, StorageOptions};

use std::sync::Arc;

/// Registry with the B2 backend registered against the real service.
pub fn default_registry() -> StorageResult<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(b2cs::B2csFactory::new(Arc::new(
        remote::s3::S3Connector,
    ))))?;
    Ok(registry)
}

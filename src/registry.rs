use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::storage::{Storage, StorageOptions};

const OP: &str = "registry.Dial";

/// Builds backend instances of one type.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Name the backend is looked up by.
    fn backend_type(&self) -> &'static str;

    async fn create(&self, opts: &StorageOptions) -> StorageResult<Arc<dyn Storage>>;
}

/// Name to constructor table for storage backends.
///
/// Owned by whoever composes the server; backends are added with explicit
/// `register` calls at startup.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) -> StorageResult<()> {
        let name = factory.backend_type().to_string();
        if self.factories.contains_key(&name) {
            return Err(StorageError::invalid(
                "registry.Register",
                format!("backend {name:?} already registered"),
            ));
        }
        info!("Storage backend registered: {}", name);
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Creates an instance of the backend registered under `name`.
    pub async fn dial(&self, name: &str, opts: &StorageOptions) -> StorageResult<Arc<dyn Storage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            StorageError::not_exist(OP, format!("backend {name:?} not registered"))
        })?;
        factory.create(opts).await
    }
}

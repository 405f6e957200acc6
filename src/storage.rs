use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{StorageError, StorageResult};

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRefsItem {
    pub reference: String,
    pub size: u64,
}

/// Result of a single `list` call. An empty `next_token` means the listing
/// is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRefs {
    pub refs: Vec<ListRefsItem>,
    pub next_token: String,
}

impl ListRefs {
    pub fn is_complete(&self) -> bool {
        self.next_token.is_empty()
    }
}

/// Uniform contract every registered backend implements.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Base URL under which stored references can be fetched directly, or
    /// `Unsupported` when the backend cannot offer one.
    async fn link_base(&self) -> StorageResult<String>;
    async fn download(&self, reference: &str) -> StorageResult<Bytes>;
    async fn put(&self, reference: &str, contents: Bytes) -> StorageResult<()>;
    async fn delete(&self, reference: &str) -> StorageResult<()>;
    /// Lists stored references one page at a time. Pass an empty token to
    /// start, then each returned `next_token` until it comes back empty.
    /// A token can be used once.
    async fn list(&self, token: &str) -> StorageResult<ListRefs>;
    fn close(&self);
}

/// String-keyed options used to construct a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageOptions(BTreeMap<String, String>);

impl StorageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Looks up an option that must be present and non-empty.
    pub fn required(&self, op: &'static str, key: &str) -> StorageResult<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(StorageError::invalid(op, format!("{key:?} option is required"))),
        }
    }

    /// Parses an optional positive integer option, falling back to `default`.
    pub fn positive_or(&self, op: &'static str, key: &str, default: usize) -> StorageResult<usize> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(StorageError::invalid(
                op,
                format!("{key:?} option must be a positive integer, got {raw:?}"),
            )),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StorageOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_required_rejects_missing_and_empty() {
        let opts = StorageOptions::new().with("bucketName", "");
        let err = opts.required("test", "bucketName").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = opts.required("test", "accountId").unwrap_err();
        assert!(err.to_string().contains("\"accountId\" option is required"));
    }

    #[test]
    fn test_positive_or() {
        let opts: StorageOptions = [("pageSize", "3"), ("cursorCacheSize", "0")]
            .into_iter()
            .collect();
        assert_eq!(opts.positive_or("test", "pageSize", 1000).unwrap(), 3);
        assert_eq!(opts.positive_or("test", "missing", 1000).unwrap(), 1000);
        let err = opts.positive_or("test", "cursorCacheSize", 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }
}

//! Seam between the storage backend and the remote object store.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub mod s3;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Service(String),
}

impl RemoteError {
    pub fn is_not_exist(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BucketAccess {
    Public,
    #[default]
    Private,
}

#[derive(Debug, Clone)]
pub struct BucketAttributes {
    pub access: BucketAccess,
}

#[derive(Debug, Clone)]
pub struct ObjectAttributes {
    pub size: u64,
}

/// An object as reported by a listing page. `size` is `None` when the
/// remote did not include it and it must be fetched separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub name: String,
    pub size: Option<u64>,
}

/// One page of the remote catalog. `next` is the remote's continuation
/// marker; `None` means this was the last page.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ListedObject>,
    pub next: Option<String>,
}

/// One stored version of an object. Hide markers left by deletes count as
/// versions too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
    pub name: String,
    pub version_id: String,
}

/// Position in a version listing: the last version a page returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    pub name: String,
    pub version_id: String,
}

/// One page of every stored version in a bucket. `next` is `None` on the
/// last page.
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub versions: Vec<ObjectVersion>,
    pub next: Option<VersionMarker>,
}

/// Everything a connector needs to open a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub account_id: String,
    pub application_key: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

/// Opens sessions against a remote object store.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> RemoteResult<Arc<dyn RemoteClient>>;
}

/// A session with a remote object store.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Succeeds when the bucket exists; `NotFound` when it does not.
    async fn open_bucket(&self, bucket: &str) -> RemoteResult<()>;
    async fn create_bucket(&self, bucket: &str) -> RemoteResult<()>;
    async fn delete_bucket(&self, bucket: &str) -> RemoteResult<()>;
    async fn bucket_attributes(&self, bucket: &str) -> RemoteResult<BucketAttributes>;
    /// URL prefix under which a public bucket's objects are served.
    fn public_url(&self, bucket: &str) -> String;

    async fn get_object(&self, bucket: &str, name: &str) -> RemoteResult<Bytes>;
    async fn put_object(&self, bucket: &str, name: &str, data: Bytes) -> RemoteResult<()>;
    /// Hides the object; `NotFound` when it does not exist. Earlier versions
    /// stay in the bucket.
    async fn delete_object(&self, bucket: &str, name: &str) -> RemoteResult<()>;
    async fn object_attributes(&self, bucket: &str, name: &str) -> RemoteResult<ObjectAttributes>;
    async fn list_page(
        &self,
        bucket: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> RemoteResult<ObjectPage>;

    /// Lists stored versions, including hide markers, after `marker`.
    async fn list_versions_page(
        &self,
        bucket: &str,
        page_size: usize,
        marker: Option<&VersionMarker>,
    ) -> RemoteResult<VersionPage>;
    /// Permanently removes one version; `NotFound` when it does not exist.
    async fn delete_object_version(
        &self,
        bucket: &str,
        name: &str,
        version_id: &str,
    ) -> RemoteResult<()>;
}

/// Runs `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> RemoteResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(RemoteError::Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(RemoteError::Cancelled),
        res = fut => res,
    }
}

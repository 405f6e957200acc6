//! Storage backend that keeps data in a Backblaze B2 bucket.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor_cache;
use crate::error::{StorageError, StorageResult};
use crate::pagination::{ObjectCursor, Paginator, DEFAULT_PAGE_SIZE};
use crate::registry::BackendFactory;
use crate::remote::{
    cancellable, BucketAccess, ConnectOptions, Connector, RemoteClient, RemoteError, VersionMarker,
};
use crate::storage::{ListRefs, Storage, StorageOptions};

/// Name the backend registers under.
pub const BACKEND_NAME: &str = "B2CS";

// Option keys.
pub const ACCOUNT_ID: &str = "accountId";
pub const APPLICATION_KEY: &str = "applicationKey";
pub const BUCKET_NAME: &str = "bucketName";
pub const REGION: &str = "region";
pub const ENDPOINT: &str = "endpoint";
pub const PAGE_SIZE: &str = "pageSize";
pub const CURSOR_CACHE_SIZE: &str = "cursorCacheSize";

const DELETE_PAGE_SIZE: usize = 128;

pub struct B2Storage {
    client: RwLock<Option<Arc<dyn RemoteClient>>>,
    bucket: String,
    access: OnceLock<BucketAccess>,
    paginator: Paginator,
    cancel: CancellationToken,
}

impl B2Storage {
    /// Validates `opts`, connects, and opens the bucket, creating it when it
    /// does not exist yet.
    pub async fn new(opts: &StorageOptions, connector: &dyn Connector) -> StorageResult<Self> {
        Self::connect("b2cs.New", opts, connector, true).await
    }

    /// Like [`B2Storage::new`], but a missing bucket is `NotExist` rather than
    /// being created.
    pub async fn open(opts: &StorageOptions, connector: &dyn Connector) -> StorageResult<Self> {
        Self::connect("b2cs.Open", opts, connector, false).await
    }

    async fn connect(
        op: &'static str,
        opts: &StorageOptions,
        connector: &dyn Connector,
        create_missing: bool,
    ) -> StorageResult<Self> {
        let account_id = opts.required(op, ACCOUNT_ID)?;
        let application_key = opts.required(op, APPLICATION_KEY)?;
        let bucket = opts.required(op, BUCKET_NAME)?.to_string();
        let page_size = opts.positive_or(op, PAGE_SIZE, DEFAULT_PAGE_SIZE)?;
        let cache_size = opts.positive_or(op, CURSOR_CACHE_SIZE, cursor_cache::DEFAULT_CAPACITY)?;

        let connect = ConnectOptions {
            account_id: account_id.to_string(),
            application_key: application_key.to_string(),
            region: opts.get(REGION).map(str::to_string),
            endpoint: opts.get(ENDPOINT).map(str::to_string),
        };
        let client = connector
            .connect(&connect)
            .await
            .map_err(|e| StorageError::io(op, format!("unable to create B2 session: {e}")))?;

        match client.open_bucket(&bucket).await {
            Ok(()) => {}
            Err(e) if e.is_not_exist() && !create_missing => {
                return Err(StorageError::not_exist(
                    op,
                    format!("B2 bucket {bucket:?} does not exist"),
                ))
            }
            Err(e) if e.is_not_exist() => {
                info!("Bucket {} does not exist, creating it", bucket);
                client.create_bucket(&bucket).await.map_err(|e| {
                    StorageError::io(op, format!("unable to create B2 bucket {bucket:?}: {e}"))
                })?;
            }
            Err(e) => {
                return Err(StorageError::io(
                    op,
                    format!("unable to obtain B2 bucket reference {bucket:?}: {e}"),
                ))
            }
        }

        // Both values were checked to be positive above.
        let page_size = NonZeroUsize::new(page_size).unwrap_or(NonZeroUsize::MIN);
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client: RwLock::new(Some(client)),
            bucket,
            access: OnceLock::new(),
            paginator: Paginator::new(page_size, cache_size),
            cancel: CancellationToken::new(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn page_size(&self) -> usize {
        self.paginator.page_size()
    }

    /// Number of listing cursors waiting to be resumed.
    pub fn pending_cursors(&self) -> usize {
        self.paginator.pending()
    }

    fn client(&self, op: &'static str) -> StorageResult<Arc<dyn RemoteClient>> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| StorageError::transient(op, "B2 implementation is not initialized"))
    }

    /// Resolves the bucket visibility, falling back to private when the
    /// remote cannot tell.
    async fn check_access(&self, client: &dyn RemoteClient) -> BucketAccess {
        match cancellable(&self.cancel, client.bucket_attributes(&self.bucket)).await {
            Ok(attrs) => attrs.access,
            Err(e) => {
                warn!("Unable to classify access of bucket {}: {}", self.bucket, e);
                BucketAccess::Private
            }
        }
    }

    /// Removes every stored version in the bucket, hide markers included,
    /// and then the bucket itself.
    pub async fn delete_bucket(&self) -> StorageResult<()> {
        const OP: &str = "b2cs.DeleteBucket";
        let client = self.client(OP)?;
        let io = |e: RemoteError| {
            StorageError::io(OP, format!("unable to delete B2 bucket {:?}: {e}", self.bucket))
        };
        let mut marker: Option<VersionMarker> = None;
        loop {
            let page = cancellable(
                &self.cancel,
                client.list_versions_page(&self.bucket, DELETE_PAGE_SIZE, marker.as_ref()),
            )
            .await
            .map_err(io)?;
            for v in &page.versions {
                let deleted = cancellable(
                    &self.cancel,
                    client.delete_object_version(&self.bucket, &v.name, &v.version_id),
                )
                .await;
                match deleted {
                    Ok(()) => {}
                    Err(e) if e.is_not_exist() => {}
                    Err(e) => return Err(io(e)),
                }
            }
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        cancellable(&self.cancel, client.delete_bucket(&self.bucket))
            .await
            .map_err(io)?;
        info!("Deleted bucket {}", self.bucket);
        Ok(())
    }
}

/// Opens an existing bucket and deletes it with everything stored in it.
/// A missing bucket is reported as `NotExist` and left alone.
pub async fn remove_bucket(opts: &StorageOptions, connector: &dyn Connector) -> StorageResult<()> {
    let b2 = B2Storage::open(opts, connector).await?;
    let res = b2.delete_bucket().await;
    b2.close();
    res
}

#[async_trait]
impl Storage for B2Storage {
    async fn link_base(&self) -> StorageResult<String> {
        const OP: &str = "b2cs.LinkBase";
        let client = self.client(OP)?;
        let access = match self.access.get() {
            Some(access) => *access,
            None => {
                let access = self.check_access(client.as_ref()).await;
                // A racing caller may have stored first; both computed the same answer.
                *self.access.get_or_init(|| access)
            }
        };
        if access == BucketAccess::Public {
            return Ok(client.public_url(&self.bucket));
        }
        Err(StorageError::Unsupported { op: OP })
    }

    async fn download(&self, reference: &str) -> StorageResult<Bytes> {
        const OP: &str = "b2cs.Download";
        let client = self.client(OP)?;
        cancellable(&self.cancel, client.get_object(&self.bucket, reference))
            .await
            .map_err(|e| match e {
                RemoteError::NotFound(_) => StorageError::not_exist(
                    OP,
                    format!("ref {reference:?} not found in B2 bucket {:?}", self.bucket),
                ),
                e => StorageError::io(
                    OP,
                    format!(
                        "unable to download ref {reference:?} from B2 bucket {:?}: {e}",
                        self.bucket
                    ),
                ),
            })
    }

    async fn put(&self, reference: &str, contents: Bytes) -> StorageResult<()> {
        const OP: &str = "b2cs.Put";
        let client = self.client(OP)?;
        cancellable(&self.cancel, client.put_object(&self.bucket, reference, contents))
            .await
            .map_err(|e| {
                StorageError::io(
                    OP,
                    format!(
                        "unable to upload ref {reference:?} to B2 bucket {:?}: {e}",
                        self.bucket
                    ),
                )
            })
    }

    async fn delete(&self, reference: &str) -> StorageResult<()> {
        const OP: &str = "b2cs.Delete";
        let client = self.client(OP)?;
        cancellable(&self.cancel, client.delete_object(&self.bucket, reference))
            .await
            .map_err(|e| match e {
                RemoteError::NotFound(_) => StorageError::not_exist(
                    OP,
                    format!("ref {reference:?} not found in B2 bucket {:?}", self.bucket),
                ),
                e => StorageError::io(
                    OP,
                    format!(
                        "unable to delete ref {reference:?} from B2 bucket {:?}: {e}",
                        self.bucket
                    ),
                ),
            })
    }

    async fn list(&self, token: &str) -> StorageResult<ListRefs> {
        const OP: &str = "b2cs.List";
        let client = self.client(OP)?;
        let bucket = self.bucket.clone();
        let cancel = self.cancel.clone();
        let page = self
            .paginator
            .list(token, move |page_size| {
                ObjectCursor::new(client, bucket, page_size, cancel)
            })
            .await?;
        debug!(
            "Listed {} refs from {} (more: {})",
            page.refs.len(),
            self.bucket,
            !page.is_complete()
        );
        Ok(page)
    }

    fn close(&self) {
        self.cancel.cancel();
        self.client.write().take();
        self.paginator.clear();
        info!("Closed B2 backend for bucket {}", self.bucket);
    }
}

/// Registry entry for [`B2Storage`].
pub struct B2csFactory {
    connector: Arc<dyn Connector>,
}

impl B2csFactory {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl BackendFactory for B2csFactory {
    fn backend_type(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn create(&self, opts: &StorageOptions) -> StorageResult<Arc<dyn Storage>> {
        let storage = B2Storage::new(opts, self.connector.as_ref()).await?;
        Ok(Arc::new(storage))
    }
}

//! In-process object store (for tests and local runs)
//!
//! Every session opened from the same [`MemoryConnector`] sees the same
//! buckets, the way separate sessions see one remote service. The connector
//! also records how often it was contacted and can inject faults.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    BucketAccess, BucketAttributes, ConnectOptions, Connector, ListedObject, ObjectAttributes,
    ObjectPage, ObjectVersion, RemoteClient, RemoteError, RemoteResult, VersionMarker, VersionPage,
};

/// Faults the in-memory store can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Omit sizes from listing pages so every entry needs an attribute lookup.
    pub unsized_listing: bool,
    /// Object names whose attribute lookup fails.
    pub attribute_failures: HashSet<String>,
    /// Make bucket attribute lookups fail.
    pub bucket_attributes: bool,
    /// Make every listing page request fail.
    pub listing: bool,
    /// Delay applied to every object and listing request.
    pub latency: Option<Duration>,
    /// Cancelled right after a listing page has been served, as if the
    /// owner closed while the response was in flight.
    pub cancel_after_listing: Option<CancellationToken>,
}

/// One stored version; `None` contents mark a hidden (deleted) object.
struct StoredVersion {
    id: String,
    contents: Option<Bytes>,
}

#[derive(Default)]
struct MemoryBucket {
    /// Versions per object name, oldest first.
    objects: BTreeMap<String, Vec<StoredVersion>>,
    access: BucketAccess,
    next_version: u64,
}

impl MemoryBucket {
    fn current(&self, name: &str) -> Option<&Bytes> {
        self.objects.get(name)?.last()?.contents.as_ref()
    }

    fn push_version(&mut self, name: &str, contents: Option<Bytes>) {
        self.next_version += 1;
        let id = format!("v{:016}", self.next_version);
        self.objects
            .entry(name.to_string())
            .or_default()
            .push(StoredVersion { id, contents });
    }

    fn visible(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.objects
            .iter()
            .filter_map(|(name, versions)| Some((name, versions.last()?.contents.as_ref()?)))
    }
}

#[derive(Default)]
struct MemoryState {
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    faults: RwLock<Faults>,
    connects: AtomicUsize,
    creates: AtomicUsize,
    list_requests: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions opened so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of listing pages requested so far.
    pub fn list_requests(&self) -> usize {
        self.state.list_requests.load(Ordering::SeqCst)
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.state.faults.write() = faults;
    }

    /// Number of bucket creations requested so far.
    pub fn creates(&self) -> usize {
        self.state.creates.load(Ordering::SeqCst)
    }

    pub fn bucket_exists(&self, bucket: &str) -> bool {
        self.state.buckets.read().contains_key(bucket)
    }

    pub fn set_access(&self, bucket: &str, access: BucketAccess) {
        self.state
            .buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .access = access;
    }

    /// Number of visible objects in `bucket`.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.state
            .buckets
            .read()
            .get(bucket)
            .map_or(0, |b| b.visible().count())
    }

    /// Number of stored versions in `bucket`, hide markers included.
    pub fn version_count(&self, bucket: &str) -> usize {
        self.state
            .buckets
            .read()
            .get(bucket)
            .map_or(0, |b| b.objects.values().map(Vec::len).sum())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _options: &ConnectOptions) -> RemoteResult<Arc<dyn RemoteClient>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryRemote {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MemoryRemote {
    state: Arc<MemoryState>,
}

impl MemoryRemote {
    fn faults(&self) -> Faults {
        self.state.faults.read().clone()
    }

    async fn delay(&self) {
        let latency = self.state.faults.read().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn with_bucket<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut MemoryBucket) -> RemoteResult<T>,
    ) -> RemoteResult<T> {
        let mut buckets = self.state.buckets.write();
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| RemoteError::NotFound(format!("bucket {bucket}")))?;
        f(b)
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn open_bucket(&self, bucket: &str) -> RemoteResult<()> {
        self.with_bucket(bucket, |_| Ok(()))
    }

    async fn create_bucket(&self, bucket: &str) -> RemoteResult<()> {
        self.state.creates.fetch_add(1, Ordering::SeqCst);
        let mut buckets = self.state.buckets.write();
        if buckets.contains_key(bucket) {
            return Err(RemoteError::Service(format!("bucket {bucket} already exists")));
        }
        buckets.insert(bucket.to_string(), MemoryBucket::default());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> RemoteResult<()> {
        let mut buckets = self.state.buckets.write();
        match buckets.get(bucket) {
            None => Err(RemoteError::NotFound(format!("bucket {bucket}"))),
            Some(b) if !b.objects.is_empty() => {
                Err(RemoteError::Service(format!("bucket {bucket} is not empty")))
            }
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }

    async fn bucket_attributes(&self, bucket: &str) -> RemoteResult<BucketAttributes> {
        if self.faults().bucket_attributes {
            return Err(RemoteError::Service("bucket attributes unavailable".into()));
        }
        self.with_bucket(bucket, |b| Ok(BucketAttributes { access: b.access }))
    }

    fn public_url(&self, bucket: &str) -> String {
        format!("memory://{bucket}/")
    }

    async fn get_object(&self, bucket: &str, name: &str) -> RemoteResult<Bytes> {
        self.delay().await;
        self.with_bucket(bucket, |b| {
            b.current(name)
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(name.to_string()))
        })
    }

    async fn put_object(&self, bucket: &str, name: &str, data: Bytes) -> RemoteResult<()> {
        self.delay().await;
        self.with_bucket(bucket, |b| {
            b.push_version(name, Some(data));
            Ok(())
        })
    }

    async fn delete_object(&self, bucket: &str, name: &str) -> RemoteResult<()> {
        self.delay().await;
        self.with_bucket(bucket, |b| {
            if b.current(name).is_none() {
                return Err(RemoteError::NotFound(name.to_string()));
            }
            b.push_version(name, None);
            Ok(())
        })
    }

    async fn object_attributes(&self, bucket: &str, name: &str) -> RemoteResult<ObjectAttributes> {
        if self.faults().attribute_failures.contains(name) {
            return Err(RemoteError::Service(format!("attributes of {name} unavailable")));
        }
        self.with_bucket(bucket, |b| {
            b.current(name)
                .map(|data| ObjectAttributes {
                    size: data.len() as u64,
                })
                .ok_or_else(|| RemoteError::NotFound(name.to_string()))
        })
    }

    async fn list_page(
        &self,
        bucket: &str,
        page_size: usize,
        continuation: Option<&str>,
    ) -> RemoteResult<ObjectPage> {
        self.state.list_requests.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let faults = self.faults();
        if faults.listing {
            return Err(RemoteError::Service("listing unavailable".into()));
        }

        let page = self.with_bucket(bucket, |b| {
            let mut remaining = b
                .visible()
                .filter(|(name, _)| continuation.map_or(true, |after| name.as_str() > after));
            let objects: Vec<ListedObject> = remaining
                .by_ref()
                .take(page_size)
                .map(|(name, data)| ListedObject {
                    name: name.clone(),
                    size: (!faults.unsized_listing).then_some(data.len() as u64),
                })
                .collect();
            let next = match (remaining.next(), objects.last()) {
                (Some(_), Some(last)) => Some(last.name.clone()),
                _ => None,
            };
            Ok(ObjectPage { objects, next })
        })?;
        if let Some(cancel) = &faults.cancel_after_listing {
            cancel.cancel();
        }
        Ok(page)
    }

    async fn list_versions_page(
        &self,
        bucket: &str,
        page_size: usize,
        marker: Option<&VersionMarker>,
    ) -> RemoteResult<VersionPage> {
        self.state.list_requests.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.faults().listing {
            return Err(RemoteError::Service("listing unavailable".into()));
        }

        self.with_bucket(bucket, |b| {
            let after = |v: &ObjectVersion| match marker {
                Some(m) => {
                    (v.name.as_str(), v.version_id.as_str())
                        > (m.name.as_str(), m.version_id.as_str())
                }
                None => true,
            };
            let mut remaining = b
                .objects
                .iter()
                .flat_map(|(name, versions)| {
                    versions.iter().map(move |v| ObjectVersion {
                        name: name.clone(),
                        version_id: v.id.clone(),
                    })
                })
                .filter(after);
            let versions: Vec<ObjectVersion> = remaining.by_ref().take(page_size).collect();
            let next = match (remaining.next(), versions.last()) {
                (Some(_), Some(last)) => Some(VersionMarker {
                    name: last.name.clone(),
                    version_id: last.version_id.clone(),
                }),
                _ => None,
            };
            Ok(VersionPage { versions, next })
        })
    }

    async fn delete_object_version(
        &self,
        bucket: &str,
        name: &str,
        version_id: &str,
    ) -> RemoteResult<()> {
        self.delay().await;
        self.with_bucket(bucket, |b| {
            let versions = b
                .objects
                .get_mut(name)
                .ok_or_else(|| RemoteError::NotFound(name.to_string()))?;
            let pos = versions
                .iter()
                .position(|v| v.id == version_id)
                .ok_or_else(|| RemoteError::NotFound(format!("{name} version {version_id}")))?;
            versions.remove(pos);
            if versions.is_empty() {
                b.objects.remove(name);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ConnectOptions {
        ConnectOptions {
            account_id: "acct".into(),
            application_key: "key".into(),
            region: None,
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn test_sessions_share_state() {
        let connector = MemoryConnector::new();
        let a = connector.connect(&options()).await.unwrap();
        let b = connector.connect(&options()).await.unwrap();
        a.create_bucket("bkt").await.unwrap();
        a.put_object("bkt", "x", Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(b.get_object("bkt", "x").await.unwrap(), Bytes::from_static(b"data"));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_list_pages_report_continuation() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        for i in 0..5 {
            remote
                .put_object("bkt", &format!("o{i}"), Bytes::from(vec![0u8; i]))
                .await
                .unwrap();
        }

        let first = remote.list_page("bkt", 2, None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        assert_eq!(first.next.as_deref(), Some("o1"));

        let second = remote.list_page("bkt", 2, first.next.as_deref()).await.unwrap();
        assert_eq!(second.objects[0].name, "o2");

        let last = remote.list_page("bkt", 2, second.next.as_deref()).await.unwrap();
        assert_eq!(last.objects.len(), 1);
        assert_eq!(last.objects[0].size, Some(4));
        assert!(last.next.is_none());
    }

    #[tokio::test]
    async fn test_exact_final_page_has_no_continuation() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        for i in 0..2 {
            remote.put_object("bkt", &format!("o{i}"), Bytes::new()).await.unwrap();
        }
        let page = remote.list_page("bkt", 2, None).await.unwrap();
        assert_eq!(page.objects.len(), 2);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_object_is_not_found() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        let err = remote.delete_object("bkt", "nope").await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn test_delete_bucket_requires_no_versions() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        remote.put_object("bkt", "x", Bytes::new()).await.unwrap();
        assert!(remote.delete_bucket("bkt").await.is_err());

        // A plain delete only hides the object.
        remote.delete_object("bkt", "x").await.unwrap();
        assert_eq!(connector.object_count("bkt"), 0);
        assert_eq!(connector.version_count("bkt"), 2);
        assert!(remote.delete_bucket("bkt").await.is_err());

        let page = remote.list_versions_page("bkt", 10, None).await.unwrap();
        for v in &page.versions {
            remote
                .delete_object_version("bkt", &v.name, &v.version_id)
                .await
                .unwrap();
        }
        remote.delete_bucket("bkt").await.unwrap();
        assert!(!connector.bucket_exists("bkt"));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_prior_version() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        remote.put_object("bkt", "x", Bytes::from_static(b"one")).await.unwrap();
        remote.put_object("bkt", "x", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(remote.get_object("bkt", "x").await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(connector.object_count("bkt"), 1);
        assert_eq!(connector.version_count("bkt"), 2);

        // Removing the newest version exposes the older one again.
        let page = remote.list_versions_page("bkt", 10, None).await.unwrap();
        let newest = page.versions.last().unwrap();
        remote
            .delete_object_version("bkt", "x", &newest.version_id)
            .await
            .unwrap();
        assert_eq!(remote.get_object("bkt", "x").await.unwrap(), Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn test_version_pages_follow_marker() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        for name in ["a", "b", "a", "c"] {
            remote.put_object("bkt", name, Bytes::new()).await.unwrap();
        }
        remote.delete_object("bkt", "b").await.unwrap();

        let mut seen = Vec::new();
        let mut marker = None;
        loop {
            let page = remote
                .list_versions_page("bkt", 2, marker.as_ref())
                .await
                .unwrap();
            seen.extend(page.versions.into_iter().map(|v| v.name));
            match page.next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec!["a", "a", "b", "b", "c"]);
    }

    #[tokio::test]
    async fn test_delete_missing_version_is_not_found() {
        let connector = MemoryConnector::new();
        let remote = connector.connect(&options()).await.unwrap();
        remote.create_bucket("bkt").await.unwrap();
        remote.put_object("bkt", "x", Bytes::new()).await.unwrap();
        let err = remote
            .delete_object_version("bkt", "x", "nope")
            .await
            .unwrap_err();
        assert!(err.is_not_exist());
    }
}

//! Resumable, token-based listing over the remote catalog.

use rand::RngCore;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cursor_cache::CursorCache;
use crate::error::{StorageError, StorageResult};
use crate::remote::{cancellable, ListedObject, RemoteClient, RemoteResult};
use crate::storage::{ListRefs, ListRefsItem};

pub const DEFAULT_PAGE_SIZE: usize = 1000;

const OP: &str = "b2cs.List";

/// 16 random bytes, hex encoded.
pub fn random_token() -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    hex::encode(b)
}

/// Live position in the remote catalog.
///
/// Buffers the remainder of the current remote page and remembers the
/// remote's continuation marker. It only lives in memory.
pub struct ObjectCursor {
    client: Arc<dyn RemoteClient>,
    bucket: String,
    page_size: usize,
    cancel: CancellationToken,
    buffered: VecDeque<ListedObject>,
    continuation: Option<String>,
    started: bool,
}

impl ObjectCursor {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        bucket: impl Into<String>,
        page_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            page_size,
            cancel,
            buffered: VecDeque::new(),
            continuation: None,
            started: false,
        }
    }

    /// Next object in the catalog, fetching another remote page when the
    /// buffer runs dry. `Ok(None)` once the catalog is exhausted.
    pub async fn next(&mut self) -> RemoteResult<Option<ListedObject>> {
        loop {
            if let Some(obj) = self.buffered.pop_front() {
                return Ok(Some(obj));
            }
            if self.is_exhausted() {
                return Ok(None);
            }
            let page = cancellable(
                &self.cancel,
                self.client
                    .list_page(&self.bucket, self.page_size, self.continuation.as_deref()),
            )
            .await?;
            self.started = true;
            self.continuation = page.next;
            self.buffered.extend(page.objects);
        }
    }

    /// True once the last remote page has been fetched and fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.started && self.buffered.is_empty() && self.continuation.is_none()
    }

    /// Size of `obj`, asking the remote when the listing did not include it.
    pub async fn size_of(&self, obj: &ListedObject) -> RemoteResult<u64> {
        if let Some(size) = obj.size {
            return Ok(size);
        }
        let attrs = cancellable(
            &self.cancel,
            self.client.object_attributes(&self.bucket, &obj.name),
        )
        .await?;
        Ok(attrs.size)
    }
}

/// Turns single `list` calls into pages of at most `page_size` references,
/// parking unfinished cursors in a bounded cache between calls.
pub struct Paginator {
    cursors: CursorCache<ObjectCursor>,
    page_size: usize,
}

impl Paginator {
    pub fn new(page_size: NonZeroUsize, cache_capacity: NonZeroUsize) -> Self {
        Self {
            cursors: CursorCache::new(cache_capacity),
            page_size: page_size.get(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of cursors waiting to be resumed.
    pub fn pending(&self) -> usize {
        self.cursors.len()
    }

    /// Drops every parked cursor.
    pub fn clear(&self) {
        self.cursors.clear();
    }

    /// Lists one page. An empty `token` starts from the beginning using the
    /// cursor built by `start`; any other token must name a parked cursor
    /// and is consumed by this call.
    pub async fn list<F>(&self, token: &str, start: F) -> StorageResult<ListRefs>
    where
        F: FnOnce(usize) -> ObjectCursor,
    {
        let mut cursor = self.cursor_for(token, start)?;

        let mut refs = Vec::new();
        while refs.len() < self.page_size {
            let next = cursor.next().await;
            let obj = match next {
                Ok(Some(obj)) => obj,
                Ok(None) => break,
                Err(e) => {
                    return Err(StorageError::io(
                        OP,
                        format!("unable to list bucket {:?}: {e}", cursor.bucket),
                    ))
                }
            };
            let size = cursor.size_of(&obj).await.map_err(|e| {
                StorageError::io(
                    OP,
                    format!("unable to get object attributes {:?}: {e}", obj.name),
                )
            })?;
            refs.push(ListRefsItem {
                reference: obj.name,
                size,
            });
        }

        if refs.len() < self.page_size || cursor.is_exhausted() {
            return Ok(ListRefs {
                refs,
                next_token: String::new(),
            });
        }

        let cancel = cursor.cancel.clone();
        let next_token = random_token();
        if let Some(evicted) = self.cursors.put(next_token.clone(), cursor) {
            debug!("Evicted listing cursor {}", evicted);
        }
        // A close that raced this call may have cleared the cache before the
        // put; the cursor must not outlive it.
        if cancel.is_cancelled() {
            self.cursors.take(&next_token);
            return Err(StorageError::io(OP, "listing cancelled"));
        }
        Ok(ListRefs { refs, next_token })
    }

    fn cursor_for<F>(&self, token: &str, start: F) -> StorageResult<ObjectCursor>
    where
        F: FnOnce(usize) -> ObjectCursor,
    {
        if token.is_empty() {
            return Ok(start(self.page_size));
        }
        self.cursors
            .take(token)
            .ok_or_else(|| StorageError::not_exist(OP, format!("unknown token: {token:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::remote::memory::{Faults, MemoryConnector};
    use crate::remote::{ConnectOptions, Connector};
    use bytes::Bytes;
    use std::collections::HashSet;

    const BUCKET: &str = "pages";

    async fn remote_with(connector: &MemoryConnector, n: usize) -> Arc<dyn RemoteClient> {
        let remote = connector
            .connect(&ConnectOptions {
                account_id: "acct".into(),
                application_key: "key".into(),
                region: None,
                endpoint: None,
            })
            .await
            .unwrap();
        remote.create_bucket(BUCKET).await.unwrap();
        for i in 0..n {
            remote
                .put_object(BUCKET, &format!("ref{i:03}"), Bytes::from(vec![1u8; i]))
                .await
                .unwrap();
        }
        remote
    }

    fn paginator(page_size: usize, capacity: usize) -> Paginator {
        Paginator::new(
            NonZeroUsize::new(page_size).unwrap(),
            NonZeroUsize::new(capacity).unwrap(),
        )
    }

    async fn list_all(
        p: &Paginator,
        remote: &Arc<dyn RemoteClient>,
    ) -> (Vec<ListRefsItem>, usize) {
        let mut token = String::new();
        let mut all = Vec::new();
        let mut calls = 0;
        loop {
            let page = p
                .list(&token, |n| {
                    ObjectCursor::new(Arc::clone(remote), BUCKET, n, CancellationToken::new())
                })
                .await
                .unwrap();
            calls += 1;
            all.extend(page.refs);
            if page.next_token.is_empty() {
                break;
            }
            token = page.next_token;
        }
        (all, calls)
    }

    #[test]
    fn test_random_token_shape() {
        let a = random_token();
        let b = random_token();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_every_item_exactly_once() {
        for page_size in 1..=7 {
            for n in [0usize, 1, 2, 6, 7, 13, 21] {
                let connector = MemoryConnector::new();
                let remote = remote_with(&connector, n).await;
                let p = paginator(page_size, 100);
                let (items, calls) = list_all(&p, &remote).await;

                assert_eq!(items.len(), n, "page_size={page_size} n={n}");
                let unique: HashSet<_> = items.iter().map(|i| i.reference.clone()).collect();
                assert_eq!(unique.len(), n);
                assert_eq!(calls, n.div_ceil(page_size).max(1), "page_size={page_size} n={n}");
                assert_eq!(p.pending(), 0);
            }
        }
    }

    #[tokio::test]
    async fn test_sizes_come_from_attributes_when_listing_omits_them() {
        let connector = MemoryConnector::new();
        let remote = remote_with(&connector, 4).await;
        connector.set_faults(Faults {
            unsized_listing: true,
            ..Faults::default()
        });
        let p = paginator(10, 100);
        let (items, _) = list_all(&p, &remote).await;
        let sizes: Vec<u64> = items.iter().map(|i| i.size).collect();
        assert_eq!(sizes, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_attribute_failure_aborts_page() {
        let connector = MemoryConnector::new();
        let remote = remote_with(&connector, 6).await;
        let p = paginator(3, 100);

        let first = p
            .list("", |n| {
                ObjectCursor::new(Arc::clone(&remote), BUCKET, n, CancellationToken::new())
            })
            .await
            .unwrap();
        assert_eq!(first.refs.len(), 3);

        connector.set_faults(Faults {
            unsized_listing: true,
            attribute_failures: ["ref004".to_string()].into_iter().collect(),
            ..Faults::default()
        });
        // The buffered page already carries sizes; the next remote page does not.
        let err = p
            .list(&first.next_token, |_| unreachable!())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("ref004"));
        assert_eq!(p.pending(), 0);

        let err = p.list(&first.next_token, |_| unreachable!()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
    }

    #[tokio::test]
    async fn test_listing_failure_is_io() {
        let connector = MemoryConnector::new();
        let remote = remote_with(&connector, 3).await;
        connector.set_faults(Faults {
            listing: true,
            ..Faults::default()
        });
        let p = paginator(2, 100);
        let err = p
            .list("", |n| {
                ObjectCursor::new(Arc::clone(&remote), BUCKET, n, CancellationToken::new())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let p = paginator(3, 100);
        let err = p
            .list("0123456789abcdef0123456789abcdef", |_| unreachable!())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
        assert!(err.to_string().contains("unknown token"));
    }

    #[tokio::test]
    async fn test_evicted_token_is_unknown() {
        let connector = MemoryConnector::new();
        let remote = remote_with(&connector, 10).await;
        let p = paginator(1, 2);
        let start = |n| ObjectCursor::new(Arc::clone(&remote), BUCKET, n, CancellationToken::new());

        let t1 = p.list("", start).await.unwrap().next_token;
        let t2 = p.list("", start).await.unwrap().next_token;
        let t3 = p.list("", start).await.unwrap().next_token;
        assert_eq!(p.pending(), 2);

        let err = p.list(&t1, start).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
        assert_eq!(p.list(&t2, start).await.unwrap().refs[0].reference, "ref001");
        assert_eq!(p.list(&t3, start).await.unwrap().refs[0].reference, "ref001");
    }

    #[tokio::test]
    async fn test_cursor_is_not_parked_after_cancel() {
        let connector = MemoryConnector::new();
        let remote = remote_with(&connector, 5).await;
        let cancel = CancellationToken::new();
        // The page arrives, but the owner is closed before it can be parked.
        connector.set_faults(Faults {
            cancel_after_listing: Some(cancel.clone()),
            ..Faults::default()
        });
        let p = paginator(2, 100);
        let err = p
            .list("", |n| ObjectCursor::new(Arc::clone(&remote), BUCKET, n, cancel.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(p.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cursor_reports_io() {
        let connector = MemoryConnector::new();
        let remote = remote_with(&connector, 5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let p = paginator(2, 100);
        let err = p
            .list("", |n| ObjectCursor::new(Arc::clone(&remote), BUCKET, n, cancel.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}

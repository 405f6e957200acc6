//! Bounded cache of in-flight listing cursors keyed by resume token.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub const DEFAULT_CAPACITY: usize = 100;

/// Fixed-capacity LRU map from token to cursor.
///
/// Entries are only ever inserted and taken, so "least recently used" is the
/// oldest unconsumed cursor. The lock is never held across an await point.
pub struct CursorCache<C> {
    entries: Mutex<LruCache<String, C>>,
}

impl<C> CursorCache<C> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Stores `cursor` under `token`. Returns the token of the entry that was
    /// evicted to make room, if any.
    pub fn put(&self, token: String, cursor: C) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.push(token.clone(), cursor) {
            Some((evicted, _)) if evicted != token => Some(evicted),
            _ => None,
        }
    }

    /// Removes and returns the cursor stored under `token`.
    pub fn take(&self, token: &str) -> Option<C> {
        self.entries.lock().pop(token)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<C> Default for CursorCache<C> {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

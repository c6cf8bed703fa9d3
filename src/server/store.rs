//! Storage of the values this node serves.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use lru::LruCache;

use crate::common::Key;

/// Default maximum number of values kept by a [MemoryStore].
pub const MAX_VALUES: usize = 1000;

/// Opaque key to bytes store.
pub trait Datastore: Debug + Send + Sync {
    fn get(&self, key: &Key) -> Option<Bytes>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: Key, value: Bytes);
}

#[derive(Debug)]
/// In-memory [Datastore] evicting the least recently used values.
pub struct MemoryStore {
    values: Mutex<LruCache<Key, Bytes>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MAX_VALUES)
    }
}

impl Datastore for MemoryStore {
    fn get(&self, key: &Key) -> Option<Bytes> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: Key, value: Bytes) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key, value);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn last_write_wins() {
        let store = MemoryStore::default();
        let key = Key::from("key");

        assert!(store.get(&key).is_none());

        store.put(key.clone(), Bytes::from_static(b"first"));
        store.put(key.clone(), Bytes::from_static(b"second"));

        assert_eq!(store.get(&key), Some(Bytes::from_static(b"second")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let store = MemoryStore::new(2);

        store.put(Key::from("a"), Bytes::from_static(b"a"));
        store.put(Key::from("b"), Bytes::from_static(b"b"));

        // Touch `a` so `b` is the oldest.
        store.get(&Key::from("a"));
        store.put(Key::from("c"), Bytes::from_static(b"c"));

        assert!(store.get(&Key::from("a")).is_some());
        assert!(store.get(&Key::from("b")).is_none());
        assert!(store.get(&Key::from("c")).is_some());
    }

    #[test]
    fn zero_capacity() {
        let store = MemoryStore::new(0);
        store.put(Key::from("a"), Bytes::from_static(b"a"));

        assert_eq!(store.len(), 1);
    }
}

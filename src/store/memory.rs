//! In-memory parent store backed by an ordered map
//!
//! Reference implementation of [`KvStore`]. Cursors snapshot the requested
//! range under the read lock, which gives them consistent contents even if
//! the store is mutated after creation.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use super::kv::{BoxedKvIterator, KvStore};

/// Thread-safe in-memory key/value store with lexicographic ordering.
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy out the full contents, in key order.
    pub fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn collect_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<(Vec<u8>, Vec<u8>)> {
        let lower = match start {
            Some(s) => Bound::Included(s.to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(e) => Bound::Excluded(e.to_vec()),
            None => Bound::Unbounded,
        };
        self.data
            .read()
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    fn has(&self, key: &[u8]) -> bool {
        self.data.read().contains_key(key)
    }

    fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.data.write().insert(key, value);
    }

    fn delete(&self, key: &[u8]) {
        self.data.write().remove(key);
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> BoxedKvIterator {
        Box::new(self.collect_range(start, end).into_iter())
    }

    fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> BoxedKvIterator {
        let mut entries = self.collect_range(start, end);
        entries.reverse();
        Box::new(entries.into_iter())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_get_set_delete() {
        let store = MemoryStore::new();
        assert!(store.get(b"a".as_ref()).is_none());

        store.set(b("a"), b("1"));
        assert_eq!(store.get(b"a".as_ref()), Some(b("1")));
        assert!(store.has(b"a".as_ref()));

        store.delete(b"a".as_ref());
        assert!(store.get(b"a".as_ref()).is_none());
        // Deleting an absent key is a no-op.
        store.delete(b"a".as_ref());
    }

    #[test]
    fn test_iterator_range_and_order() {
        let store = MemoryStore::new();
        for k in ["k1", "k2", "k3", "k5"] {
            store.set(b(k), b("v"));
        }

        let keys: Vec<Vec<u8>> = store
            .iterator(Some(b"k1".as_ref()), Some(b"k5".as_ref()))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b("k1"), b("k2"), b("k3")]);

        let rev: Vec<Vec<u8>> = store
            .reverse_iterator(None, None)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(rev, vec![b("k5"), b("k3"), b("k2"), b("k1")]);
    }

    #[test]
    fn test_iterator_is_snapshot() {
        let store = MemoryStore::new();
        store.set(b("a"), b("1"));

        let iter = store.iterator(None, None);
        store.set(b("b"), b("2"));

        let keys: Vec<Vec<u8>> = iter.map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b("a")]);
    }
}

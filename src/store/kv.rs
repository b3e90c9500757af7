//! Key/value store trait - the contract a parent store must satisfy
//!
//! Keys and values are opaque byte vectors. Range cursors yield entries in
//! stable lexicographic order over `[start, end)`; `None` bounds are
//! unbounded on that side.

/// Owned range cursor over a store.
///
/// Cursors are owned rather than borrow-tied so that callers can merge them
/// with speculative state without wrestling the store's internal locking.
/// Implementations may stream or snapshot; the parent store is read-only for
/// the duration of a batch, so the two are observationally identical.
pub type BoxedKvIterator = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send>;

/// Committed key/value state underneath a batch.
///
/// Mutation methods take `&self`: the flush step writes through the same
/// shared handle the execution views read through, so implementations use
/// interior mutability.
pub trait KvStore: Send + Sync {
    /// Get the value for a key, or `None` if absent.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Whether a key is present.
    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Set a key to a value.
    fn set(&self, key: Vec<u8>, value: Vec<u8>);

    /// Delete a key. Deleting an absent key is a no-op.
    fn delete(&self, key: &[u8]);

    /// Ascending cursor over `[start, end)`.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> BoxedKvIterator;

    /// Descending cursor over `[start, end)`.
    fn reverse_iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> BoxedKvIterator;
}

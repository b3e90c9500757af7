//! Version-indexed store - one transaction's window onto the batch
//!
//! Presents a single ordered view combining the transaction's own pending
//! writes, the newest versioned values from lower writer indices, and the
//! parent store, while recording every read and range scan for later
//! validation. Writes stay local until the scheduler publishes them; an
//! estimate met during a read or scan aborts the attempt with the blocking
//! writer's index so the scheduler can register the dependency.

use std::sync::Arc;

use crate::store::KvStore;
use crate::{Error, Result};

use super::iterator::{IterationTracker, MergeIterator};
use super::store::MultiVersionStore;
use super::value::{Incarnation, ReadSet, TxIndex, ValueKind, WriteSet};

// ============================================================================
// Version Indexed Store
// ============================================================================

/// Execution-time store view for one transaction incarnation.
pub struct VersionIndexedStore {
    index: TxIndex,
    incarnation: Incarnation,
    multiversion: Arc<MultiVersionStore>,
    parent: Arc<dyn KvStore>,
    /// Pending writes, local until published.
    writeset: WriteSet,
    /// Observed values; doubles as the read cache, so repeated reads within
    /// one incarnation stay internally consistent.
    readset: ReadSet,
    /// Completed or abandoned range scans.
    iterateset: Vec<IterationTracker>,
}

impl VersionIndexedStore {
    /// Create a view for one incarnation of the transaction at `index`.
    pub fn new(index: TxIndex, incarnation: Incarnation, multiversion: Arc<MultiVersionStore>) -> Self {
        let parent = multiversion.parent();
        Self {
            index,
            incarnation,
            multiversion,
            parent,
            writeset: WriteSet::new(),
            readset: ReadSet::new(),
            iterateset: Vec::new(),
        }
    }

    /// Batch position of the owning transaction.
    pub fn index(&self) -> TxIndex {
        self.index
    }

    /// Incarnation this view belongs to.
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read a key.
    ///
    /// Resolution order: own pending writes, previously observed values,
    /// newest versioned value from a lower writer, then the parent store.
    /// Meets an estimate with an abort carrying the blocking writer's index:
    /// the attempt is speculative garbage and must retry after that writer
    /// settles.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(op) = self.writeset.get(key) {
            return Ok(op.clone());
        }
        if let Some(observed) = self.readset.get(key) {
            return Ok(observed.clone());
        }
        match self.multiversion.get_latest_before(self.index, key) {
            Some(versioned) => match versioned.kind {
                ValueKind::Estimate => Err(Error::ReadDependency {
                    blocking: versioned.index,
                }),
                ValueKind::Concrete(value) => {
                    self.readset.insert(key.to_vec(), Some(value.clone()));
                    Ok(Some(value))
                }
                ValueKind::Deleted => {
                    self.readset.insert(key.to_vec(), None);
                    Ok(None)
                }
            },
            None => {
                let value = self.parent.get(key);
                self.readset.insert(key.to_vec(), value.clone());
                Ok(value)
            }
        }
    }

    /// Whether a key is present. Recorded like a read.
    pub fn has(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Stage a write. Not visible to other transactions until published.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writeset.insert(key.to_vec(), Some(value.to_vec()));
    }

    /// Stage a deletion.
    pub fn delete(&mut self, key: &[u8]) {
        self.writeset.insert(key.to_vec(), None);
    }

    // ========================================================================
    // Range scans
    // ========================================================================

    /// Ascending scan over `[start, end)`.
    pub fn iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> StoreIter<'_> {
        self.range_iter(start, end, false)
    }

    /// Descending scan over `[start, end)`.
    pub fn reverse_iterator(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> StoreIter<'_> {
        self.range_iter(start, end, true)
    }

    fn range_iter(&mut self, start: Option<&[u8]>, end: Option<&[u8]>, reverse: bool) -> StoreIter<'_> {
        let merge =
            self.multiversion
                .merge_iterator(self.index, &self.writeset, start, end, reverse);
        let tracker = IterationTracker::new(
            start.map(|s| s.to_vec()),
            end.map(|e| e.to_vec()),
            reverse,
            self.writeset.clone(),
        );
        StoreIter {
            view: self,
            merge,
            tracker: Some(tracker),
            aborted: false,
        }
    }

    // ========================================================================
    // Handover
    // ========================================================================

    /// Consume the view, yielding everything this incarnation recorded.
    /// The scheduler publishes these on completed execution and discards
    /// them on abort.
    pub fn finish(self) -> (WriteSet, ReadSet, Vec<IterationTracker>) {
        (self.writeset, self.readset, self.iterateset)
    }
}

// ============================================================================
// Tracked range scan
// ============================================================================

/// Range scan handle over a view.
///
/// Yields merged entries in order while recording the observed key sequence.
/// Dropping the handle before exhaustion records an early stop, so
/// validation only replays the prefix that was actually seen.
pub struct StoreIter<'a> {
    view: &'a mut VersionIndexedStore,
    merge: MergeIterator,
    tracker: Option<IterationTracker>,
    aborted: bool,
}

impl Iterator for StoreIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.aborted {
            return None;
        }
        let tracker = self.tracker.as_mut()?;
        match self.merge.next() {
            None => {
                tracker.exhausted = true;
                None
            }
            Some(Err(err)) => {
                self.aborted = true;
                Some(Err(err))
            }
            Some(Ok(item)) => {
                tracker.observed.push(item.key.clone());
                if !item.own && !self.view.readset.contains_key(&item.key) {
                    self.view
                        .readset
                        .insert(item.key.clone(), Some(item.value.clone()));
                }
                Some(Ok((item.key, item.value)))
            }
        }
    }
}

impl Drop for StoreIter<'_> {
    fn drop(&mut self) {
        // An aborted scan belongs to an abandoned incarnation; there is
        // nothing worth validating later.
        if self.aborted {
            return;
        }
        if let Some(mut tracker) = self.tracker.take() {
            if !tracker.exhausted {
                tracker.early_stop = tracker.observed.last().cloned();
            }
            self.view.iterateset.push(tracker);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

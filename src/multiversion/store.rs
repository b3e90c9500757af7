//! Multiversion store - the shared speculative ledger for one logical store
//!
//! Holds every version of every key written during a batch, plus the
//! bookkeeping needed to second-guess each transaction after the fact: which
//! keys it wrote (so stale versions can be removed or estimated), which
//! values it observed (readset), and which range scans it ran (iterateset).
//!
//! Per-key operations are individually atomic: the ledger is a sharded map
//! of version chains, and lookups copy entries out rather than aliasing
//! them, so a reader that resolved a version before a concurrent removal is
//! unaffected by it. No cross-key atomicity is provided or assumed. An
//! insert-only ordered key index sits beside the sharded map so range scans
//! can walk keys in order without a ledger-wide lock.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;

use crate::store::KvStore;
use crate::{Error, Result};

use super::iterator::{
    key_in_range, replay_iteration, IterationTracker, MergeIterator, SpeculativeEntry,
};
use super::value::{
    Incarnation, ReadSet, TxIndex, ValueKind, VersionChain, VersionedValue, WriteSet,
};

// ============================================================================
// Multiversion Store
// ============================================================================

/// Versioned ledger and per-transaction bookkeeping for one logical store.
pub struct MultiVersionStore {
    /// Store name, used in log and error context.
    name: String,
    /// The committed state underneath the batch. Read-only until flush.
    parent: Arc<dyn KvStore>,
    /// key -> version chain ordered by writer index.
    versioned: DashMap<Vec<u8>, VersionChain>,
    /// Insert-only ordered index over every key that ever had a version.
    /// A key whose chain has emptied is skipped at walk time.
    key_index: SkipMap<Vec<u8>, ()>,
    /// writer index -> keys its latest published writeset covered.
    writeset_keys: DashMap<TxIndex, BTreeSet<Vec<u8>>>,
    /// writer index -> values its latest execution observed.
    readsets: DashMap<TxIndex, ReadSet>,
    /// writer index -> range scans its latest execution ran.
    iteratesets: DashMap<TxIndex, Vec<IterationTracker>>,
}

impl MultiVersionStore {
    /// Create an empty ledger over a parent store.
    pub fn new(name: impl Into<String>, parent: Arc<dyn KvStore>) -> Self {
        Self {
            name: name.into(),
            parent,
            versioned: DashMap::new(),
            key_index: SkipMap::new(),
            writeset_keys: DashMap::new(),
            readsets: DashMap::new(),
            iteratesets: DashMap::new(),
        }
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the parent store.
    pub fn parent(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.parent)
    }

    /// Number of keys with at least one recorded version.
    pub fn key_count(&self) -> usize {
        self.versioned.len()
    }

    // ========================================================================
    // Writeset maintenance
    // ========================================================================

    /// Publish a transaction's writeset into the ledger.
    ///
    /// Replaces any prior entry this writer had per key (estimates included)
    /// and records the exact key set for later invalidation or removal.
    pub fn set_writeset(&self, index: TxIndex, incarnation: Incarnation, writeset: WriteSet) {
        let mut keys = BTreeSet::new();
        for (key, op) in writeset {
            let kind = match op {
                Some(value) => ValueKind::Concrete(value),
                None => ValueKind::Deleted,
            };
            self.key_index.insert(key.clone(), ());
            self.versioned
                .entry(key.clone())
                .or_default()
                .insert(index, incarnation, kind);
            keys.insert(key);
        }
        self.writeset_keys.insert(index, keys);
    }

    /// Convert every value this writer previously published into an
    /// estimate marker.
    ///
    /// Concurrent readers mid-flight then observe "uncertain" instead of a
    /// stale concrete value. Idempotent, and works from the store's own
    /// record of the writeset.
    pub fn invalidate_writeset(&self, index: TxIndex, incarnation: Incarnation) {
        let keys = match self.writeset_keys.get(&index) {
            Some(keys) => keys.clone(),
            None => return,
        };
        for key in keys {
            if let Some(mut chain) = self.versioned.get_mut(&key) {
                chain.mark_estimate(index, incarnation);
            }
        }
    }

    /// Drop ledger entries for keys this writer published before but will
    /// not publish in `new_writeset`. Keys present in both sets are left in
    /// place for the upcoming [`set_writeset`] to overwrite.
    pub fn remove_old_writeset(&self, index: TxIndex, new_writeset: &WriteSet) {
        let old_keys = match self.writeset_keys.get(&index) {
            Some(keys) => keys.clone(),
            None => return,
        };
        for key in old_keys {
            if new_writeset.contains_key(&key) {
                continue;
            }
            if let Some(mut chain) = self.versioned.get_mut(&key) {
                chain.remove(index);
            }
            self.versioned.remove_if(&key, |_, chain| chain.is_empty());
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// The version with the greatest writer index strictly below `index`.
    ///
    /// `None` means "no speculative writer below this index"; callers must
    /// fall through to the parent store, never treat the absence as a value.
    pub fn get_latest_before(&self, index: TxIndex, key: &[u8]) -> Option<VersionedValue> {
        self.versioned.get(key)?.latest_before(index)
    }

    /// The newest version of a key across all writers.
    pub fn get_latest(&self, key: &[u8]) -> Option<VersionedValue> {
        self.versioned.get(key)?.latest()
    }

    /// The newest settled (non-estimate) version of a key.
    pub fn get_latest_non_estimate(&self, key: &[u8]) -> Option<VersionedValue> {
        self.versioned.get(key)?.latest_non_estimate()
    }

    // ========================================================================
    // Read/iteration recording
    // ========================================================================

    /// Replace the recorded readset for a writer. A new incarnation
    /// supersedes all prior observations.
    pub fn set_readset(&self, index: TxIndex, readset: ReadSet) {
        self.readsets.insert(index, readset);
    }

    /// Replace the recorded range scans for a writer.
    pub fn set_iterateset(&self, index: TxIndex, iterateset: Vec<IterationTracker>) {
        self.iteratesets.insert(index, iterateset);
    }

    /// The recorded readset for a writer, if any.
    pub fn readset(&self, index: TxIndex) -> Option<ReadSet> {
        self.readsets.get(&index).map(|r| r.value().clone())
    }

    /// Publish everything one completed execution recorded: writes into the
    /// ledger (with stale keys removed first), reads and scans into the
    /// validation records.
    pub fn publish(
        &self,
        index: TxIndex,
        incarnation: Incarnation,
        writeset: WriteSet,
        readset: ReadSet,
        iterateset: Vec<IterationTracker>,
    ) {
        self.remove_old_writeset(index, &writeset);
        self.set_writeset(index, incarnation, writeset);
        self.set_readset(index, readset);
        self.set_iterateset(index, iterateset);
    }

    // ========================================================================
    // Merge walks
    // ========================================================================

    /// Speculative entries visible to `index` within `[start, end)`, in walk
    /// order, with `writeset` overlaid as the transaction's own writes.
    fn collect_speculative(
        &self,
        index: TxIndex,
        writeset: &WriteSet,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> Vec<(Vec<u8>, SpeculativeEntry)> {
        let mut merged: BTreeMap<Vec<u8>, SpeculativeEntry> = BTreeMap::new();

        let lower = match start {
            Some(s) => Bound::Included(s),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(e) => Bound::Excluded(e),
            None => Bound::Unbounded,
        };
        for entry in self.key_index.range::<[u8], _>((lower, upper)) {
            if let Some(chain) = self.versioned.get(entry.key()) {
                if let Some(versioned) = chain.latest_before(index) {
                    merged.insert(entry.key().clone(), SpeculativeEntry::Versioned(versioned));
                }
            }
        }

        // Own writes shadow lower writers on the same key.
        for (key, op) in writeset {
            if key_in_range(key, start, end) {
                merged.insert(key.clone(), SpeculativeEntry::Own(op.clone()));
            }
        }

        let mut entries: Vec<(Vec<u8>, SpeculativeEntry)> = merged.into_iter().collect();
        if reverse {
            entries.reverse();
        }
        entries
    }

    /// Build a merge walk over parent state and everything visible to
    /// `index`, with `writeset` overlaid.
    pub(crate) fn merge_iterator(
        &self,
        index: TxIndex,
        writeset: &WriteSet,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        reverse: bool,
    ) -> MergeIterator {
        let cursor = if reverse {
            self.parent.reverse_iterator(start, end)
        } else {
            self.parent.iterator(start, end)
        };
        let speculative = self.collect_speculative(index, writeset, start, end, reverse);
        MergeIterator::new(cursor, speculative, reverse)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Re-check everything a transaction's latest execution observed against
    /// the ledger as it stands now.
    ///
    /// Returns whether the observations still hold, plus the deduplicated,
    /// sorted writer indices this transaction turned out to depend on.
    /// An estimate met in the readset adds a conflict without failing
    /// validity (the writer may republish the same value); an estimate met
    /// during scan replay fails validity and adds the conflict, and a value
    /// or key-sequence mismatch fails validity outright.
    pub fn validate_transaction_state(&self, index: TxIndex) -> (bool, Vec<TxIndex>) {
        let mut valid = true;
        let mut conflicts: BTreeSet<TxIndex> = BTreeSet::new();

        if let Some(readset) = self.readsets.get(&index) {
            for (key, expected) in readset.iter() {
                match self.get_latest_before(index, key) {
                    None => {
                        // No speculative writer below us: the read must
                        // match the parent store directly.
                        if &self.parent.get(key) != expected {
                            valid = false;
                        }
                    }
                    Some(versioned) => match versioned.kind {
                        ValueKind::Estimate => {
                            conflicts.insert(versioned.index);
                        }
                        ValueKind::Deleted => {
                            if expected.is_some() {
                                valid = false;
                                conflicts.insert(versioned.index);
                            }
                        }
                        ValueKind::Concrete(value) => {
                            if expected.as_deref() != Some(value.as_slice()) {
                                valid = false;
                                conflicts.insert(versioned.index);
                            }
                        }
                    },
                }
            }
        }

        if let Some(trackers) = self.iteratesets.get(&index) {
            for tracker in trackers.iter() {
                let merge = self.merge_iterator(
                    index,
                    &tracker.writeset,
                    tracker.start.as_deref(),
                    tracker.end.as_deref(),
                    tracker.reverse,
                );
                let outcome = replay_iteration(merge, tracker);
                if !outcome.valid {
                    valid = false;
                }
                conflicts.extend(outcome.conflicts);
            }
        }

        debug_assert!(
            conflicts.iter().all(|&c| c < index),
            "conflict indices must come from lower writers"
        );
        (valid, conflicts.into_iter().collect())
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write the newest version of every key into the parent store, in
    /// lexicographic key order. Deletions are applied as deletes.
    ///
    /// Any surviving estimate means the batch was flushed before
    /// convergence; the flush stops with an error rather than committing
    /// unknown data.
    pub fn write_latest_to_store(&self) -> Result<()> {
        for entry in self.key_index.iter() {
            let latest = match self.versioned.get(entry.key()) {
                Some(chain) => match chain.latest() {
                    Some(latest) => latest,
                    None => continue,
                },
                None => continue,
            };
            match latest.kind {
                ValueKind::Concrete(value) => self.parent.set(entry.key().clone(), value),
                ValueKind::Deleted => self.parent.delete(entry.key()),
                ValueKind::Estimate => {
                    log::error!(
                        "store '{}': estimate from writer {} still present at flush",
                        self.name,
                        latest.index
                    );
                    return Err(Error::EstimateAtCommit {
                        store: self.name.clone(),
                        key: entry.key().clone(),
                        index: latest.index,
                    });
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn writeset(entries: &[(&str, Option<&str>)]) -> WriteSet {
        entries
            .iter()
            .map(|(k, v)| (b(k), v.map(b)))
            .collect()
    }

    fn readset(entries: &[(&str, Option<&str>)]) -> ReadSet {
        writeset(entries)
    }

    fn store_with_parent(entries: &[(&str, &str)]) -> MultiVersionStore {
        let parent = Arc::new(MemoryStore::new());
        for (k, v) in entries {
            parent.set(b(k), b(v));
        }
        MultiVersionStore::new("test", parent)
    }

    #[test]
    fn test_visibility_is_index_directional() {
        let mvs = store_with_parent(&[]);
        mvs.set_writeset(2, 0, writeset(&[("a", Some("two"))]));

        // Lower and equal indices never see index 2's write.
        assert!(mvs.get_latest_before(1, b"a".as_ref()).is_none());
        assert!(mvs.get_latest_before(2, b"a".as_ref()).is_none());
        // Higher indices do.
        let v = mvs.get_latest_before(3, b"a".as_ref()).unwrap();
        assert_eq!(v.index, 2);
        assert_eq!(v.value(), Some(b"two".as_ref()));
    }

    #[test]
    fn test_invalidate_then_republish() {
        let mvs = store_with_parent(&[]);
        mvs.set_writeset(1, 0, writeset(&[("a", Some("v0")), ("b", Some("v0"))]));

        mvs.invalidate_writeset(1, 1);
        assert!(mvs.get_latest_before(5, b"a".as_ref()).unwrap().kind.is_estimate());
        assert!(mvs.get_latest_before(5, b"b".as_ref()).unwrap().kind.is_estimate());
        assert!(mvs.get_latest_non_estimate(b"a".as_ref()).is_none());
        // Idempotent.
        mvs.invalidate_writeset(1, 1);

        // Re-execution writes only "a"; "b" must disappear entirely.
        let new = writeset(&[("a", Some("v1"))]);
        mvs.remove_old_writeset(1, &new);
        mvs.set_writeset(1, 1, new);

        assert_eq!(
            mvs.get_latest_before(5, b"a".as_ref()).unwrap().value(),
            Some(b"v1".as_ref())
        );
        assert!(mvs.get_latest_before(5, b"b".as_ref()).is_none());
    }

    #[test]
    fn test_copy_on_read_lookup() {
        let mvs = store_with_parent(&[]);
        mvs.set_writeset(1, 0, writeset(&[("a", Some("v0"))]));

        let held = mvs.get_latest_before(5, b"a".as_ref()).unwrap();
        mvs.remove_old_writeset(1, &WriteSet::new());

        // The copy resolved before removal is unaffected.
        assert_eq!(held.value(), Some(b"v0".as_ref()));
        assert!(mvs.get_latest_before(5, b"a".as_ref()).is_none());
    }

    #[test]
    fn test_validate_readset_against_parent() {
        let mvs = store_with_parent(&[("a", "base")]);
        mvs.set_readset(3, readset(&[("a", Some("base")), ("missing", None)]));

        let (valid, conflicts) = mvs.validate_transaction_state(3);
        assert!(valid);
        assert!(conflicts.is_empty());
        assert_eq!(mvs.readset(3).unwrap().len(), 2);
    }

    #[test]
    fn test_validate_detects_changed_value() {
        let mvs = store_with_parent(&[]);
        // Task 3 read "a" as "1" (task 0's original output).
        mvs.set_writeset(0, 0, writeset(&[("a", Some("1"))]));
        mvs.set_readset(3, readset(&[("a", Some("1"))]));
        assert!(mvs.validate_transaction_state(3).0);

        // Task 0 re-executed and now writes "9".
        mvs.set_writeset(0, 1, writeset(&[("a", Some("9"))]));
        let (valid, conflicts) = mvs.validate_transaction_state(3);
        assert!(!valid);
        assert_eq!(conflicts, vec![0]);
    }

    #[test]
    fn test_validate_detects_deletion_mismatch() {
        let mvs = store_with_parent(&[]);
        mvs.set_writeset(1, 0, writeset(&[("a", Some("1"))]));
        mvs.set_readset(3, readset(&[("a", Some("1"))]));

        mvs.set_writeset(1, 1, writeset(&[("a", None)]));
        let (valid, conflicts) = mvs.validate_transaction_state(3);
        assert!(!valid);
        assert_eq!(conflicts, vec![1]);
    }

    #[test]
    fn test_validate_estimate_in_readset_is_soft() {
        let mvs = store_with_parent(&[]);
        mvs.set_writeset(1, 0, writeset(&[("a", Some("1"))]));
        mvs.set_readset(3, readset(&[("a", Some("1"))]));

        mvs.invalidate_writeset(1, 1);
        let (valid, conflicts) = mvs.validate_transaction_state(3);
        // Unknown, not failed: the writer may republish the same value.
        assert!(valid);
        assert_eq!(conflicts, vec![1]);
    }

    #[test]
    fn test_validate_iteration_detects_removed_key() {
        let mvs = store_with_parent(&[("k2", "p2")]);
        // Task 1 wrote k4; task 3 scanned [k1, k5) and saw {k2, k4}.
        mvs.set_writeset(1, 0, writeset(&[("k4", Some("v4"))]));
        let mut tracker =
            IterationTracker::new(Some(b("k1")), Some(b("k5")), false, WriteSet::new());
        tracker.observed = vec![b("k2"), b("k4")];
        tracker.exhausted = true;
        mvs.set_iterateset(3, vec![tracker]);
        assert!(mvs.validate_transaction_state(3).0);

        // Task 1's re-execution no longer writes k4.
        mvs.remove_old_writeset(1, &WriteSet::new());
        mvs.set_writeset(1, 1, WriteSet::new());
        let (valid, _) = mvs.validate_transaction_state(3);
        assert!(!valid);
    }

    #[test]
    fn test_validate_iteration_estimate_reports_dependency() {
        let mvs = store_with_parent(&[("k2", "p2")]);
        mvs.set_writeset(1, 0, writeset(&[("k4", Some("v4"))]));
        let mut tracker =
            IterationTracker::new(Some(b("k1")), Some(b("k5")), false, WriteSet::new());
        tracker.observed = vec![b("k2"), b("k4")];
        tracker.exhausted = true;
        mvs.set_iterateset(3, vec![tracker]);

        mvs.invalidate_writeset(1, 1);
        let (valid, conflicts) = mvs.validate_transaction_state(3);
        assert!(!valid);
        // The estimate's writer must surface so the scheduler can wait on it.
        assert_eq!(conflicts, vec![1]);
    }

    #[test]
    fn test_iteration_replay_uses_recorded_own_writes() {
        let mvs = store_with_parent(&[]);
        // The scan saw the transaction's own pending write of "b".
        let mut tracker = IterationTracker::new(
            None,
            None,
            false,
            writeset(&[("b", Some("mine"))]),
        );
        tracker.observed = vec![b("b")];
        tracker.exhausted = true;
        mvs.set_iterateset(2, vec![tracker]);

        let (valid, conflicts) = mvs.validate_transaction_state(2);
        assert!(valid);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_flush_applies_latest_in_key_order() {
        let parent = Arc::new(MemoryStore::new());
        parent.set(b("gone"), b("old"));
        let mvs = MultiVersionStore::new("test", Arc::clone(&parent) as Arc<dyn KvStore>);

        mvs.set_writeset(0, 0, writeset(&[("a", Some("a0")), ("gone", None)]));
        mvs.set_writeset(2, 0, writeset(&[("a", Some("a2"))]));

        mvs.write_latest_to_store().unwrap();
        assert_eq!(parent.get(b"a".as_ref()), Some(b("a2")));
        assert!(parent.get(b"gone".as_ref()).is_none());
    }

    #[test]
    fn test_flush_rejects_surviving_estimate() {
        let mvs = store_with_parent(&[]);
        mvs.set_writeset(1, 0, writeset(&[("a", Some("1"))]));
        mvs.invalidate_writeset(1, 1);

        match mvs.write_latest_to_store() {
            Err(Error::EstimateAtCommit { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected EstimateAtCommit, got {:?}", other),
        }
    }
}

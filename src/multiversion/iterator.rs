//! Merge iterators - one ordered view over parent and speculative state
//!
//! A merge walk interleaves the parent store's cursor with the speculative
//! entries visible to one transaction (versioned writes from lower indices
//! plus the transaction's own pending writeset). Speculative entries shadow
//! parent entries on key collisions, deletions are skipped rather than
//! emitted, and an estimate stops the walk with a dependency on its writer.
//!
//! The same machinery serves two callers: execution-time range scans, which
//! additionally record what they observe, and post-execution validation,
//! which replays a recorded scan and checks that it still observes the same
//! key sequence.

use std::cmp::Ordering;

use crate::store::BoxedKvIterator;
use crate::{Error, Result};

use super::value::{TxIndex, ValueKind, VersionedValue, WriteSet};

// ============================================================================
// Speculative input
// ============================================================================

/// One speculative entry fed into a merge walk.
#[derive(Debug, Clone)]
pub(crate) enum SpeculativeEntry {
    /// The executing transaction's own pending write (`None` = deletion).
    Own(Option<Vec<u8>>),
    /// A resolved version-chain entry from a lower writer index.
    Versioned(VersionedValue),
}

/// An entry yielded by a merge walk.
#[derive(Debug)]
pub(crate) struct MergeItem {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Whether the entry came from the transaction's own writeset.
    pub own: bool,
}

/// Whether `key` falls within the `[start, end)` range.
pub(crate) fn key_in_range(key: &[u8], start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    if let Some(s) = start {
        if key < s {
            return false;
        }
    }
    if let Some(e) = end {
        if key >= e {
            return false;
        }
    }
    true
}

// ============================================================================
// Merge Iterator
// ============================================================================

/// Ordered two-way merge of a parent cursor and speculative entries.
///
/// Yields `Err` with a read dependency when it runs into an estimate, and is
/// fused afterwards: an execution that hits an estimate is abandoned, so
/// there is nothing meaningful to yield past that point.
pub(crate) struct MergeIterator {
    parent_head: Option<(Vec<u8>, Vec<u8>)>,
    parent: BoxedKvIterator,
    speculative_head: Option<(Vec<u8>, SpeculativeEntry)>,
    speculative: std::vec::IntoIter<(Vec<u8>, SpeculativeEntry)>,
    reverse: bool,
    done: bool,
}

impl MergeIterator {
    /// Build a merge over a parent cursor and speculative entries.
    ///
    /// `speculative` must already be sorted in walk order (ascending for a
    /// forward walk, descending for a reverse walk) and restricted to the
    /// cursor's range.
    pub(crate) fn new(
        parent: BoxedKvIterator,
        speculative: Vec<(Vec<u8>, SpeculativeEntry)>,
        reverse: bool,
    ) -> Self {
        let mut parent = parent;
        let mut speculative = speculative.into_iter();
        Self {
            parent_head: parent.next(),
            parent,
            speculative_head: speculative.next(),
            speculative,
            reverse,
            done: false,
        }
    }

    fn advance_parent(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        std::mem::replace(&mut self.parent_head, self.parent.next())
    }

    fn advance_speculative(&mut self) -> Option<(Vec<u8>, SpeculativeEntry)> {
        std::mem::replace(&mut self.speculative_head, self.speculative.next())
    }

    /// Whether the parent head comes before the speculative head in walk
    /// order.
    fn parent_first(&self, pk: &[u8], sk: &[u8]) -> bool {
        match pk.cmp(sk) {
            Ordering::Equal => false,
            Ordering::Less => !self.reverse,
            Ordering::Greater => self.reverse,
        }
    }
}

/// Which head a merge step should consume.
enum Pick {
    Parent,
    Speculative,
    /// Same key on both sides: speculative shadows parent.
    Shadowed,
    Done,
}

impl Iterator for MergeIterator {
    type Item = Result<MergeItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let pick = match (&self.parent_head, &self.speculative_head) {
                (None, None) => Pick::Done,
                (Some(_), None) => Pick::Parent,
                (None, Some(_)) => Pick::Speculative,
                (Some((pk, _)), Some((sk, _))) => {
                    if pk == sk {
                        Pick::Shadowed
                    } else if self.parent_first(pk, sk) {
                        Pick::Parent
                    } else {
                        Pick::Speculative
                    }
                }
            };

            match pick {
                Pick::Done => {
                    self.done = true;
                    return None;
                }
                Pick::Parent => {
                    if let Some((key, value)) = self.advance_parent() {
                        return Some(Ok(MergeItem {
                            key,
                            value,
                            own: false,
                        }));
                    }
                    continue;
                }
                Pick::Shadowed => {
                    self.advance_parent();
                }
                Pick::Speculative => {}
            }

            let Some((key, entry)) = self.advance_speculative() else {
                continue;
            };
            match entry {
                SpeculativeEntry::Own(Some(value)) => {
                    return Some(Ok(MergeItem {
                        key,
                        value,
                        own: true,
                    }));
                }
                SpeculativeEntry::Own(None) => continue,
                SpeculativeEntry::Versioned(versioned) => match versioned.kind {
                    ValueKind::Concrete(value) => {
                        return Some(Ok(MergeItem {
                            key,
                            value,
                            own: false,
                        }));
                    }
                    ValueKind::Deleted => continue,
                    ValueKind::Estimate => {
                        self.done = true;
                        return Some(Err(Error::ReadDependency {
                            blocking: versioned.index,
                        }));
                    }
                },
            }
        }
    }
}

// ============================================================================
// Iteration Tracker
// ============================================================================

/// Record of one range scan performed during execution, kept for replay at
/// validation time.
#[derive(Debug, Clone)]
pub struct IterationTracker {
    /// Inclusive lower bound of the scan, `None` for unbounded.
    pub start: Option<Vec<u8>>,
    /// Exclusive upper bound of the scan, `None` for unbounded.
    pub end: Option<Vec<u8>>,
    /// Whether the scan walked in descending order.
    pub reverse: bool,
    /// Keys yielded to the caller, in yield order.
    pub observed: Vec<Vec<u8>>,
    /// The key the scan stopped at when abandoned before exhaustion.
    pub early_stop: Option<Vec<u8>>,
    /// Whether the scan ran to the end of its range.
    pub exhausted: bool,
    /// The transaction's own pending writes at scan time.
    pub writeset: WriteSet,
}

impl IterationTracker {
    pub(crate) fn new(
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        reverse: bool,
        writeset: WriteSet,
    ) -> Self {
        Self {
            start,
            end,
            reverse,
            observed: Vec::new(),
            early_stop: None,
            exhausted: false,
            writeset,
        }
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Result of replaying one recorded scan against current state.
#[derive(Debug)]
pub(crate) struct ReplayOutcome {
    pub valid: bool,
    pub conflicts: Vec<TxIndex>,
}

impl ReplayOutcome {
    fn valid() -> Self {
        Self {
            valid: true,
            conflicts: Vec::new(),
        }
    }

    fn invalid() -> Self {
        Self {
            valid: false,
            conflicts: Vec::new(),
        }
    }
}

/// Replay a recorded scan over a freshly built merge walk and check that it
/// observes the same keys in the same order.
///
/// A scan that was abandoned early only vouches for the prefix it actually
/// observed; replay stops once that prefix is confirmed. A scan that ran to
/// exhaustion also vouches for the absence of further keys. Estimates met
/// during replay invalidate the transaction and report the estimate's writer
/// as a conflict, so the scheduler can wait on it instead of retrying blind.
pub(crate) fn replay_iteration(merge: MergeIterator, tracker: &IterationTracker) -> ReplayOutcome {
    if tracker.observed.is_empty() && !tracker.exhausted {
        // Nothing was observed and nothing was ruled out.
        return ReplayOutcome::valid();
    }

    let mut matched = 0usize;
    for item in merge {
        let item = match item {
            Ok(item) => item,
            Err(Error::ReadDependency { blocking }) => {
                return ReplayOutcome {
                    valid: false,
                    conflicts: vec![blocking],
                };
            }
            Err(_) => return ReplayOutcome::invalid(),
        };

        match tracker.observed.get(matched) {
            Some(expected) if *expected == item.key => {
                matched += 1;
                if matched == tracker.observed.len() && !tracker.exhausted {
                    // The recorded scan stopped here; later keys are not
                    // part of its obligation.
                    return ReplayOutcome::valid();
                }
            }
            // A different key surfaced, or an extra key appeared after a
            // scan that had seen its range to the end.
            _ => return ReplayOutcome::invalid(),
        }
    }

    if matched == tracker.observed.len() {
        ReplayOutcome::valid()
    } else {
        // A previously observed key no longer surfaces.
        ReplayOutcome::invalid()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryStore};

    fn b(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn versioned(index: TxIndex, kind: ValueKind) -> SpeculativeEntry {
        SpeculativeEntry::Versioned(VersionedValue {
            index,
            incarnation: 0,
            kind,
        })
    }

    fn parent_with(keys: &[(&str, &str)]) -> MemoryStore {
        let store = MemoryStore::new();
        for (k, v) in keys {
            store.set(b(k), b(v));
        }
        store
    }

    fn collect_keys(merge: MergeIterator) -> Vec<Vec<u8>> {
        merge.map(|r| r.unwrap().key).collect()
    }

    #[test]
    fn test_merge_interleaves_and_shadows() {
        let parent = parent_with(&[("a", "pa"), ("c", "pc")]);
        let entries = vec![
            (b("b"), versioned(0, ValueKind::Concrete(b("vb")))),
            (b("c"), versioned(0, ValueKind::Concrete(b("vc")))),
        ];
        let merge = MergeIterator::new(parent.iterator(None, None), entries, false);

        let items: Vec<MergeItem> = merge.map(|r| r.unwrap()).collect();
        let keys: Vec<&[u8]> = items.iter().map(|i| i.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
        // "c" comes from the speculative side, shadowing the parent.
        assert_eq!(items[2].value, b("vc"));
    }

    #[test]
    fn test_merge_skips_deletions() {
        let parent = parent_with(&[("a", "pa"), ("b", "pb")]);
        let entries = vec![
            (b("b"), versioned(0, ValueKind::Deleted)),
            (b("c"), SpeculativeEntry::Own(None)),
        ];
        let merge = MergeIterator::new(parent.iterator(None, None), entries, false);
        assert_eq!(collect_keys(merge), vec![b("a")]);
    }

    #[test]
    fn test_merge_reverse_order() {
        let parent = parent_with(&[("a", "pa"), ("d", "pd")]);
        let entries = vec![
            (b("c"), SpeculativeEntry::Own(Some(b("vc")))),
            (b("b"), versioned(1, ValueKind::Concrete(b("vb")))),
        ];
        let merge = MergeIterator::new(parent.reverse_iterator(None, None), entries, true);
        assert_eq!(collect_keys(merge), vec![b("d"), b("c"), b("b"), b("a")]);
    }

    #[test]
    fn test_merge_stops_on_estimate_with_writer() {
        let parent = parent_with(&[("a", "pa"), ("c", "pc")]);
        let entries = vec![(b("b"), versioned(3, ValueKind::Estimate))];
        let mut merge = MergeIterator::new(parent.iterator(None, None), entries, false);

        assert_eq!(merge.next().unwrap().unwrap().key, b("a"));
        match merge.next() {
            Some(Err(Error::ReadDependency { blocking })) => assert_eq!(blocking, 3),
            other => panic!("expected dependency abort, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(merge.next().is_none());
    }

    #[test]
    fn test_replay_exact_match() {
        let parent = parent_with(&[("a", "1"), ("b", "2")]);
        let mut tracker = IterationTracker::new(None, None, false, WriteSet::new());
        tracker.observed = vec![b("a"), b("b")];
        tracker.exhausted = true;

        let merge = MergeIterator::new(parent.iterator(None, None), Vec::new(), false);
        let outcome = replay_iteration(merge, &tracker);
        assert!(outcome.valid);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn test_replay_detects_missing_and_extra_keys() {
        let parent = parent_with(&[("a", "1")]);
        let mut tracker = IterationTracker::new(None, None, false, WriteSet::new());
        tracker.observed = vec![b("a"), b("b")];
        tracker.exhausted = true;

        // "b" disappeared.
        let merge = MergeIterator::new(parent.iterator(None, None), Vec::new(), false);
        assert!(!replay_iteration(merge, &tracker).valid);

        // An extra key appeared after an exhaustive scan.
        let parent = parent_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let merge = MergeIterator::new(parent.iterator(None, None), Vec::new(), false);
        assert!(!replay_iteration(merge, &tracker).valid);
    }

    #[test]
    fn test_replay_early_stop_ignores_tail() {
        let parent = parent_with(&[("a", "1"), ("b", "2"), ("z", "9")]);
        let mut tracker = IterationTracker::new(None, None, false, WriteSet::new());
        tracker.observed = vec![b("a")];
        tracker.early_stop = Some(b("a"));
        tracker.exhausted = false;

        // The tail changed, but the scan never vouched for it.
        let merge = MergeIterator::new(parent.iterator(None, None), Vec::new(), false);
        assert!(replay_iteration(merge, &tracker).valid);
    }

    #[test]
    fn test_replay_estimate_reports_writer() {
        let parent = parent_with(&[("a", "1"), ("c", "3")]);
        let mut tracker = IterationTracker::new(None, None, false, WriteSet::new());
        tracker.observed = vec![b("a"), b("c")];
        tracker.exhausted = true;

        let entries = vec![(b("b"), versioned(2, ValueKind::Estimate))];
        let merge = MergeIterator::new(parent.iterator(None, None), entries, false);
        let outcome = replay_iteration(merge, &tracker);
        assert!(!outcome.valid);
        assert_eq!(outcome.conflicts, vec![2]);
    }

    #[test]
    fn test_replay_vacuous_when_nothing_observed() {
        let parent = parent_with(&[("a", "1")]);
        let tracker = IterationTracker::new(None, None, false, WriteSet::new());

        let merge = MergeIterator::new(parent.iterator(None, None), Vec::new(), false);
        assert!(replay_iteration(merge, &tracker).valid);
    }

    #[test]
    fn test_key_in_range() {
        assert!(key_in_range(b"b", Some(b"a"), Some(b"c")));
        assert!(key_in_range(b"a", Some(b"a"), Some(b"c")));
        assert!(!key_in_range(b"c", Some(b"a"), Some(b"c")));
        assert!(key_in_range(b"zz", None, None));
    }
}

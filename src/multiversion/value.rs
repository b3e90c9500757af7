//! Versioned values - per-key version chains for speculative execution
//!
//! Every write made by a transaction in a batch lands in a version chain
//! keyed by the writer's position in the batch. Readers at position `i` see
//! the entry with the greatest writer index strictly below `i`; a chain entry
//! can also be an estimate, marking a write whose producer was invalidated
//! and has not yet re-executed.

use std::collections::BTreeMap;

/// Position of a transaction within its batch. Lower index means logically
/// earlier; conflicts always resolve in favor of the lower index.
pub type TxIndex = usize;

/// Execution attempt counter for a transaction. Bumped on every re-execution.
pub type Incarnation = u32;

/// Pending writes of one transaction incarnation, in key order.
/// `None` marks a deletion.
pub type WriteSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Values observed by one transaction incarnation, in key order.
/// `None` records that the key was seen as absent or deleted.
pub type ReadSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

// ============================================================================
// Value Kind
// ============================================================================

/// What a version chain entry holds.
///
/// Deletion is a first-class entry rather than an absence: a reader above a
/// deleting writer must observe "deleted" instead of falling through to the
/// parent store. An estimate marks a write whose content is currently
/// unknown; readers must suspend on it rather than guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// A concrete value written by the transaction.
    Concrete(Vec<u8>),
    /// The transaction deleted this key.
    Deleted,
    /// The transaction's write was invalidated and not yet replaced.
    Estimate,
}

impl ValueKind {
    /// Whether this entry is an estimate marker.
    pub fn is_estimate(&self) -> bool {
        matches!(self, ValueKind::Estimate)
    }

    /// Whether this entry is a deletion marker.
    pub fn is_deleted(&self) -> bool {
        matches!(self, ValueKind::Deleted)
    }

    /// The concrete bytes, if any.
    pub fn as_concrete(&self) -> Option<&[u8]> {
        match self {
            ValueKind::Concrete(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Versioned Value
// ============================================================================

/// A single resolved chain entry, as returned by lookups.
///
/// Lookups copy the entry out of the chain, so a caller holding one is not
/// affected by concurrent chain mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Batch position of the transaction that produced this entry.
    pub index: TxIndex,
    /// Incarnation of that transaction at write time.
    pub incarnation: Incarnation,
    /// The entry payload.
    pub kind: ValueKind,
}

impl VersionedValue {
    /// The concrete value, treating deletions and estimates as absent.
    pub fn value(&self) -> Option<&[u8]> {
        self.kind.as_concrete()
    }
}

// ============================================================================
// Version Chain
// ============================================================================

/// Chain entry as stored: the per-writer payload without the index (the
/// index is the map key).
#[derive(Debug, Clone)]
struct VersionCell {
    incarnation: Incarnation,
    kind: ValueKind,
}

/// All versions of a single key, ordered by writer index.
///
/// At most one entry exists per writer index; a re-executing writer replaces
/// its own entry in place.
#[derive(Debug, Default)]
pub struct VersionChain {
    versions: BTreeMap<TxIndex, VersionCell>,
}

impl VersionChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            versions: BTreeMap::new(),
        }
    }

    /// Insert or replace the entry for a writer.
    pub fn insert(&mut self, index: TxIndex, incarnation: Incarnation, kind: ValueKind) {
        self.versions.insert(index, VersionCell { incarnation, kind });
    }

    /// Remove the entry for a writer, if present.
    pub fn remove(&mut self, index: TxIndex) {
        self.versions.remove(&index);
    }

    /// Convert the entry for a writer into an estimate marker.
    ///
    /// No-op when the writer has no entry, so invalidation does not need to
    /// know the writeset beforehand and can run more than once.
    pub fn mark_estimate(&mut self, index: TxIndex, incarnation: Incarnation) {
        if let Some(cell) = self.versions.get_mut(&index) {
            cell.incarnation = incarnation;
            cell.kind = ValueKind::Estimate;
        }
    }

    /// The entry with the greatest writer index strictly below `index`.
    ///
    /// `None` strictly means "no speculative writer below this index"; the
    /// caller falls through to the parent store, never treats the absence as
    /// a value.
    pub fn latest_before(&self, index: TxIndex) -> Option<VersionedValue> {
        self.versions
            .range(..index)
            .next_back()
            .map(|(&idx, cell)| VersionedValue {
                index: idx,
                incarnation: cell.incarnation,
                kind: cell.kind.clone(),
            })
    }

    /// The entry with the greatest writer index, regardless of reader.
    pub fn latest(&self) -> Option<VersionedValue> {
        self.versions
            .iter()
            .next_back()
            .map(|(&idx, cell)| VersionedValue {
                index: idx,
                incarnation: cell.incarnation,
                kind: cell.kind.clone(),
            })
    }

    /// The entry with the greatest writer index whose value is settled
    /// (concrete or deleted, not an estimate).
    pub fn latest_non_estimate(&self) -> Option<VersionedValue> {
        self.versions
            .iter()
            .rev()
            .find(|(_, cell)| !cell.kind.is_estimate())
            .map(|(&idx, cell)| VersionedValue {
                index: idx,
                incarnation: cell.incarnation,
                kind: cell.kind.clone(),
            })
    }

    /// Whether the chain holds no versions.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Number of versions in the chain.
    pub fn len(&self) -> usize {
        self.versions.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn concrete(v: &str) -> ValueKind {
        ValueKind::Concrete(v.as_bytes().to_vec())
    }

    #[test]
    fn test_latest_before_visibility() {
        let mut chain = VersionChain::new();
        chain.insert(1, 0, concrete("one"));
        chain.insert(4, 0, concrete("four"));

        // Reader at index 0 sees nothing below it.
        assert!(chain.latest_before(0).is_none());
        // Reader at index 1 does not see its own slot.
        assert!(chain.latest_before(1).is_none());
        // Readers between the writers see the lower writer.
        let v = chain.latest_before(3).unwrap();
        assert_eq!(v.index, 1);
        assert_eq!(v.kind, concrete("one"));
        // Readers above both see the higher writer.
        assert_eq!(chain.latest_before(9).unwrap().index, 4);
    }

    #[test]
    fn test_insert_replaces_same_writer() {
        let mut chain = VersionChain::new();
        chain.insert(2, 0, concrete("a"));
        chain.insert(2, 1, concrete("b"));

        assert_eq!(chain.len(), 1);
        let v = chain.latest_before(5).unwrap();
        assert_eq!(v.incarnation, 1);
        assert_eq!(v.kind, concrete("b"));
    }

    #[test]
    fn test_mark_estimate() {
        let mut chain = VersionChain::new();
        chain.insert(2, 0, concrete("a"));
        chain.mark_estimate(2, 1);

        let v = chain.latest_before(5).unwrap();
        assert!(v.kind.is_estimate());
        assert_eq!(v.incarnation, 1);

        // Marking a writer with no entry is a no-op.
        chain.mark_estimate(7, 0);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_latest_non_estimate_skips_estimates() {
        let mut chain = VersionChain::new();
        chain.insert(1, 0, concrete("settled"));
        chain.insert(4, 0, concrete("pending"));
        chain.mark_estimate(4, 1);

        assert_eq!(chain.latest().unwrap().index, 4);
        let settled = chain.latest_non_estimate().unwrap();
        assert_eq!(settled.index, 1);
        assert_eq!(settled.kind, concrete("settled"));

        chain.mark_estimate(1, 1);
        assert!(chain.latest_non_estimate().is_none());
    }

    #[test]
    fn test_deleted_is_an_entry_not_absence() {
        let mut chain = VersionChain::new();
        chain.insert(1, 0, ValueKind::Deleted);

        let v = chain.latest_before(3).unwrap();
        assert!(v.kind.is_deleted());
        assert!(v.value().is_none());
    }

    #[test]
    fn test_remove_and_empty() {
        let mut chain = VersionChain::new();
        chain.insert(1, 0, concrete("a"));
        chain.remove(1);
        assert!(chain.is_empty());
        assert!(chain.latest().is_none());
    }
}

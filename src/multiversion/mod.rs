//! Multiversion subsystem - speculative state for optimistic execution
//!
//! Lets a batch of transactions execute out of order while observing exactly
//! the state a sequential run would show them:
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              MultiVersionStore                    │
//! │  - per-key version chains ordered by writer      │
//! │  - readset/writeset/iterateset per transaction   │
//! │  - validation and final flush                    │
//! ├──────────────────────────────────────────────────┤
//! │  VersionIndexedStore                             │
//! │  - one transaction's view at its batch index     │
//! │  - records reads and scans, stages writes        │
//! │  - aborts on estimates with the blocking writer  │
//! ├──────────────────────────────────────────────────┤
//! │  Merge iterators                                 │
//! │  - parent ∪ speculative entries, in key order    │
//! │  - scan replay for post-execution validation     │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod iterator;
pub mod store;
pub mod value;
pub mod view;

pub use iterator::IterationTracker;
pub use store::MultiVersionStore;
pub use value::{Incarnation, ReadSet, TxIndex, ValueKind, VersionChain, VersionedValue, WriteSet};
pub use view::{StoreIter, VersionIndexedStore};

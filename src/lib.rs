//! Parastate - deterministic parallel transaction execution
//!
//! Executes ordered batches of transactions speculatively across a worker
//! pool, detects conflicts through readset and range-scan validation against
//! a multiversioned key/value ledger, and converges to the exact state and
//! per-transaction results a sequential run would produce.

pub mod multiversion;
pub mod scheduler;
pub mod store;

// Re-export main types
pub use multiversion::{
    Incarnation, MultiVersionStore, TxIndex, ValueKind, VersionIndexedStore, VersionedValue,
};
pub use scheduler::{BatchOutput, Scheduler, SchedulerConfig, TaskContext, TaskOutput};
pub use store::{KvStore, MemoryStore};

/// Execution engine error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A read observed an estimate: the value depends on a writer that has
    /// not settled yet. Not a failure: the signal to suspend the current
    /// attempt and retry after `blocking` validates.
    #[error("read depends on unresolved write from transaction {blocking}")]
    ReadDependency { blocking: TxIndex },

    /// An estimate survived to the flush step. Always an engine defect:
    /// convergence is supposed to have replaced or removed every estimate.
    #[error("estimate from transaction {index} still present in store '{store}' at commit")]
    EstimateAtCommit {
        store: String,
        key: Vec<u8>,
        index: TxIndex,
    },

    /// A task asked for a store the scheduler was not configured with.
    #[error("unknown store: {0}")]
    UnknownStore(String),

    /// Engine invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

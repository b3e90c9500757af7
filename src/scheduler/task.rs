//! Task state - per-transaction bookkeeping owned by the scheduler
//!
//! One task exists per batch entry for the lifetime of the batch. Status and
//! incarnation move as the scheduler drives the task through execution,
//! validation, and possible re-execution; the dependency set holds lower
//! writer indices the task must wait on before another attempt.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::multiversion::{Incarnation, MultiVersionStore, TxIndex, VersionIndexedStore};
use crate::{Error, Result};

// ============================================================================
// Task Status
// ============================================================================

/// Where a task currently stands in the batch lifecycle.
///
/// `Validated` is terminal within a wave but can be revoked by a later wave
/// when an earlier task's re-execution changes what this task observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Not yet executed in its current incarnation.
    Pending,
    /// Currently running on a worker.
    Executing,
    /// Finished executing; writeset published, awaiting validation.
    Executed,
    /// Being re-checked against the current ledger.
    Validating,
    /// Observations confirmed against the current ledger.
    Validated,
    /// Observations contradicted; will retry with a new incarnation.
    Invalid,
    /// Blocked on unresolved lower writers.
    Waiting,
}

// ============================================================================
// Task Output
// ============================================================================

/// Application-level result of one transaction execution.
///
/// Retained even when `success` is false (e.g. the operation itself failed
/// but its effects, like fee deduction, still stand): the batch result
/// reports the outcome of every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Whether the operation reported success.
    pub success: bool,
    /// Opaque response payload for the caller.
    pub response: Vec<u8>,
}

impl TaskOutput {
    /// A successful output with the given payload.
    pub fn ok(response: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            response: response.into(),
        }
    }

    /// A failed output with the given payload.
    pub fn failed(response: impl Into<Vec<u8>>) -> Self {
        Self {
            success: false,
            response: response.into(),
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// Scheduler-owned state for one batch entry.
pub struct Task {
    index: TxIndex,
    incarnation: AtomicU32,
    status: RwLock<TaskStatus>,
    dependencies: Mutex<BTreeSet<TxIndex>>,
    response: Mutex<Option<TaskOutput>>,
}

impl Task {
    /// Create a fresh task at batch position `index`.
    pub fn new(index: TxIndex) -> Self {
        Self {
            index,
            incarnation: AtomicU32::new(0),
            status: RwLock::new(TaskStatus::Pending),
            dependencies: Mutex::new(BTreeSet::new()),
            response: Mutex::new(None),
        }
    }

    /// Batch position.
    pub fn index(&self) -> TxIndex {
        self.index
    }

    /// Current incarnation.
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Move to the next incarnation, returning it.
    pub fn bump_incarnation(&self) -> Incarnation {
        self.incarnation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        *self.status.read()
    }

    /// Set the status.
    pub fn set_status(&self, status: TaskStatus) {
        *self.status.write() = status;
    }

    /// Register a lower writer this task must wait on.
    pub fn add_dependency(&self, dep: TxIndex) {
        self.dependencies.lock().insert(dep);
    }

    /// Register several dependencies at once.
    pub fn add_dependencies(&self, deps: impl IntoIterator<Item = TxIndex>) {
        self.dependencies.lock().extend(deps);
    }

    /// Snapshot of the dependency set.
    pub fn dependencies(&self) -> BTreeSet<TxIndex> {
        self.dependencies.lock().clone()
    }

    /// Store the result of the latest completed execution.
    pub fn set_response(&self, output: TaskOutput) {
        *self.response.lock() = Some(output);
    }

    /// Take the final response out of the task.
    pub fn take_response(&self) -> Option<TaskOutput> {
        self.response.lock().take()
    }
}

// ============================================================================
// Task Context
// ============================================================================

/// What a transaction execution sees: one version-indexed view per logical
/// store, all pinned to the same index and incarnation.
///
/// Handed to the execution callback; the scheduler consumes it afterwards to
/// publish (on completion) or discard (on abort) everything it recorded.
pub struct TaskContext {
    index: TxIndex,
    incarnation: Incarnation,
    views: BTreeMap<String, VersionIndexedStore>,
}

impl TaskContext {
    pub(crate) fn new(
        index: TxIndex,
        incarnation: Incarnation,
        stores: &BTreeMap<String, Arc<MultiVersionStore>>,
    ) -> Self {
        let views = stores
            .iter()
            .map(|(name, store)| {
                (
                    name.clone(),
                    VersionIndexedStore::new(index, incarnation, Arc::clone(store)),
                )
            })
            .collect();
        Self {
            index,
            incarnation,
            views,
        }
    }

    /// Batch position of the executing transaction.
    pub fn index(&self) -> TxIndex {
        self.index
    }

    /// Incarnation of this attempt.
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// The view over a named logical store.
    pub fn store(&mut self, name: &str) -> Result<&mut VersionIndexedStore> {
        self.views
            .get_mut(name)
            .ok_or_else(|| Error::UnknownStore(name.to_string()))
    }

    pub(crate) fn into_views(self) -> BTreeMap<String, VersionIndexedStore> {
        self.views
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle() {
        let task = Task::new(3);
        assert_eq!(task.index(), 3);
        assert_eq!(task.incarnation(), 0);
        assert_eq!(task.status(), TaskStatus::Pending);

        task.set_status(TaskStatus::Executing);
        task.set_status(TaskStatus::Executed);
        assert_eq!(task.status(), TaskStatus::Executed);

        assert_eq!(task.bump_incarnation(), 1);
        assert_eq!(task.incarnation(), 1);
    }

    #[test]
    fn test_task_dependencies_dedup() {
        let task = Task::new(5);
        task.add_dependency(1);
        task.add_dependency(1);
        task.add_dependencies([0, 2]);

        let deps: Vec<TxIndex> = task.dependencies().into_iter().collect();
        assert_eq!(deps, vec![0, 1, 2]);
    }

    #[test]
    fn test_task_response_retained() {
        let task = Task::new(0);
        task.set_response(TaskOutput::failed("out of gas"));
        let out = task.take_response().unwrap();
        assert!(!out.success);
        assert_eq!(out.response, b"out of gas");
        assert!(task.take_response().is_none());
    }

    #[test]
    fn test_context_unknown_store() {
        let stores = BTreeMap::new();
        let mut ctx = TaskContext::new(0, 0, &stores);
        match ctx.store("nope") {
            Err(Error::UnknownStore(name)) => assert_eq!(name, "nope"),
            other => panic!("expected UnknownStore, got {:?}", other.map(|_| ())),
        }
    }
}

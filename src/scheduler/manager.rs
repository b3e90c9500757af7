//! Scheduler - drives a batch to a deterministic, serial-equivalent result
//!
//! Coordinates the batch lifecycle:
//! 1. Execute every runnable task concurrently, each against a fresh
//!    version-indexed view bound to its current incarnation.
//! 2. Publish what completed executions recorded into the multiversion
//!    stores.
//! 3. Validate executed (and previously validated) tasks concurrently.
//! 4. Invalidate tasks whose observations no longer hold: estimate their
//!    writes, bump their incarnation, fold the conflict indices into their
//!    dependency set, and reschedule them once those dependencies validate.
//! 5. Repeat until every task validates, or a wave cap is hit and the
//!    remainder runs sequentially, which bounds every contention pathology.
//! 6. Flush each store's newest values into its parent, in deterministic
//!    order.
//!
//! Conflicts always resolve in favor of the lower batch index, so the final
//! state and every task's response match a sequential run of the batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::multiversion::{MultiVersionStore, TxIndex};
use crate::store::KvStore;
use crate::{Error, Result};

use super::stats::SchedulerStats;
use super::task::{Task, TaskContext, TaskOutput, TaskStatus};

// ============================================================================
// Configuration
// ============================================================================

/// Default number of execute/validate waves before the sequential fallback.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads in the pool. `0` uses one per available core.
    pub workers: usize,
    /// Wave cap before falling back to sequential execution.
    pub max_iterations: usize,
    /// When false, batches run purely sequentially on the calling thread.
    pub parallel: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            parallel: true,
        }
    }
}

// ============================================================================
// Batch result
// ============================================================================

/// Result of one converged batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutput {
    /// Per-task outputs, in batch order.
    pub outputs: Vec<TaskOutput>,
    /// Whether the batch hit the wave cap and finished sequentially.
    pub sequential_fallback: bool,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Executes batches of transactions against named parent stores.
///
/// The scheduler is long-lived; each batch gets fresh multiversion ledgers
/// over the same parents, and the parents are mutated only by the final
/// flush.
pub struct Scheduler {
    parents: BTreeMap<String, Arc<dyn KvStore>>,
    config: SchedulerConfig,
    pool: rayon::ThreadPool,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Create a scheduler over the given parent stores.
    pub fn new(
        parents: BTreeMap<String, Arc<dyn KvStore>>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            parents,
            config,
            pool,
            stats: SchedulerStats::new(),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Counters accumulated across batches.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Execute a batch to convergence and flush the result.
    ///
    /// `handler` runs one transaction against its context and reports the
    /// application-level outcome; it must leave its views exactly as the
    /// outcome should be published (a failed-but-durable operation keeps its
    /// writes, a rolled-back one clears them before returning).
    pub fn execute_batch<T, F>(&self, txs: &[T], handler: F) -> Result<BatchOutput>
    where
        T: Sync,
        F: Fn(&T, &mut TaskContext) -> Result<TaskOutput> + Sync,
    {
        if txs.is_empty() {
            return Ok(BatchOutput {
                outputs: Vec::new(),
                sequential_fallback: false,
            });
        }
        self.stats.record_batch();

        let stores: BTreeMap<String, Arc<MultiVersionStore>> = self
            .parents
            .iter()
            .map(|(name, parent)| {
                (
                    name.clone(),
                    Arc::new(MultiVersionStore::new(name.clone(), Arc::clone(parent))),
                )
            })
            .collect();
        let tasks: Vec<Task> = (0..txs.len()).map(Task::new).collect();

        let mut sequential_fallback = false;
        if self.config.parallel {
            let converged = self.run_waves(&tasks, &stores, txs, &handler)?;
            if !converged {
                let first_unvalidated = tasks
                    .iter()
                    .position(|t| t.status() != TaskStatus::Validated)
                    .unwrap_or(tasks.len());
                log::warn!(
                    "batch of {} tasks did not converge within {} waves; \
                     finishing sequentially from index {}",
                    tasks.len(),
                    self.config.max_iterations,
                    first_unvalidated
                );
                self.stats.record_sequential_fallback();
                sequential_fallback = true;
                self.run_sequential(&tasks, &stores, txs, &handler, first_unvalidated)?;
            }
        } else {
            self.run_sequential(&tasks, &stores, txs, &handler, 0)?;
        }

        for (name, store) in &stores {
            store.write_latest_to_store()?;
            log::debug!("flushed store '{}' ({} keys touched)", name, store.key_count());
        }

        let outputs = tasks
            .iter()
            .map(|task| {
                task.take_response().ok_or_else(|| {
                    Error::Internal(format!("task {} converged without a response", task.index()))
                })
            })
            .collect::<Result<Vec<TaskOutput>>>()?;
        Ok(BatchOutput {
            outputs,
            sequential_fallback,
        })
    }

    // ========================================================================
    // Parallel waves
    // ========================================================================

    /// Run execute/validate waves until every task validates or the wave cap
    /// is hit. Returns whether the batch converged.
    fn run_waves<T, F>(
        &self,
        tasks: &[Task],
        stores: &BTreeMap<String, Arc<MultiVersionStore>>,
        txs: &[T],
        handler: &F,
    ) -> Result<bool>
    where
        T: Sync,
        F: Fn(&T, &mut TaskContext) -> Result<TaskOutput> + Sync,
    {
        // First fatal (non-contention) error from any worker.
        let failure: Mutex<Option<Error>> = Mutex::new(None);

        for wave in 0..self.config.max_iterations {
            self.stats.record_wave();

            // A task re-runs only once everything it waits on has validated,
            // so it cannot thrash against a still-unstable dependency.
            let runnable: Vec<TxIndex> = tasks
                .iter()
                .filter(|task| match task.status() {
                    TaskStatus::Pending | TaskStatus::Waiting => task
                        .dependencies()
                        .iter()
                        .all(|&dep| tasks[dep].status() == TaskStatus::Validated),
                    _ => false,
                })
                .map(Task::index)
                .collect();

            self.pool.install(|| {
                runnable.par_iter().for_each(|&index| {
                    if let Err(err) =
                        Self::execute_task(&tasks[index], stores, &txs[index], handler, &self.stats)
                    {
                        let mut slot = failure.lock();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                });
            });
            if let Some(err) = failure.lock().take() {
                return Err(err);
            }

            // Validate everything executed so far, previously validated
            // tasks included: an earlier task's re-execution in this wave
            // may have pulled the ground out from under them.
            let candidates: Vec<TxIndex> = tasks
                .iter()
                .filter(|task| {
                    matches!(task.status(), TaskStatus::Executed | TaskStatus::Validated)
                })
                .map(Task::index)
                .collect();
            for &index in &candidates {
                tasks[index].set_status(TaskStatus::Validating);
            }
            let verdicts: Vec<(TxIndex, bool, Vec<TxIndex>)> = self.pool.install(|| {
                candidates
                    .par_iter()
                    .map(|&index| {
                        self.stats.record_validation();
                        let (valid, conflicts) = Self::validate_across_stores(stores, index);
                        (index, valid, conflicts)
                    })
                    .collect()
            });

            // Settle verdicts in index order: lower indices win conflicts.
            let mut wave_invalidations = 0usize;
            for (index, valid, conflicts) in verdicts {
                let task = &tasks[index];
                if valid && conflicts.is_empty() {
                    task.set_status(TaskStatus::Validated);
                } else if valid {
                    // Estimates in the readset: unresolved, not contradicted.
                    // Leave the task executed; a later wave settles it
                    // without re-execution if the writers republish the same
                    // values.
                    task.set_status(TaskStatus::Executed);
                } else {
                    wave_invalidations += 1;
                    self.stats.record_invalidation();
                    task.set_status(TaskStatus::Invalid);
                    let incarnation = task.incarnation();
                    for store in stores.values() {
                        store.invalidate_writeset(index, incarnation);
                    }
                    task.add_dependencies(conflicts);
                    task.bump_incarnation();
                    task.set_status(TaskStatus::Pending);
                }
            }

            if wave_invalidations == 0
                && tasks
                    .iter()
                    .all(|task| task.status() == TaskStatus::Validated)
            {
                log::debug!(
                    "batch of {} tasks converged after {} wave(s)",
                    tasks.len(),
                    wave + 1
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Execute one task attempt and publish or discard its recordings.
    fn execute_task<T, F>(
        task: &Task,
        stores: &BTreeMap<String, Arc<MultiVersionStore>>,
        tx: &T,
        handler: &F,
        stats: &SchedulerStats,
    ) -> Result<()>
    where
        F: Fn(&T, &mut TaskContext) -> Result<TaskOutput>,
    {
        task.set_status(TaskStatus::Executing);
        let incarnation = task.incarnation();
        let mut ctx = TaskContext::new(task.index(), incarnation, stores);

        match handler(tx, &mut ctx) {
            Ok(output) => {
                stats.record_execution();
                for (name, view) in ctx.into_views() {
                    let (writeset, readset, iterateset) = view.finish();
                    if let Some(store) = stores.get(&name) {
                        store.publish(task.index(), incarnation, writeset, readset, iterateset);
                    }
                }
                task.set_response(output);
                task.set_status(TaskStatus::Executed);
                Ok(())
            }
            Err(Error::ReadDependency { blocking }) => {
                // Speculative garbage: discard this attempt and wait for the
                // blocking writer to settle. Nothing was published.
                stats.record_estimate_abort();
                task.add_dependency(blocking);
                task.bump_incarnation();
                task.set_status(TaskStatus::Waiting);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Validate one task against every store, combining the results.
    fn validate_across_stores(
        stores: &BTreeMap<String, Arc<MultiVersionStore>>,
        index: TxIndex,
    ) -> (bool, Vec<TxIndex>) {
        let mut valid = true;
        let mut conflicts: BTreeSet<TxIndex> = BTreeSet::new();
        for store in stores.values() {
            let (store_valid, store_conflicts) = store.validate_transaction_state(index);
            valid &= store_valid;
            conflicts.extend(store_conflicts);
        }
        (valid, conflicts.into_iter().collect())
    }

    // ========================================================================
    // Sequential execution
    // ========================================================================

    /// Execute tasks one at a time in batch order, starting at `start`.
    ///
    /// Serves both the `parallel = false` mode (from index 0) and the
    /// post-cap fallback: already-validated tasks above `start` are
    /// re-checked against the by-then-stable prefix and re-executed only if
    /// their observations no longer hold.
    fn run_sequential<T, F>(
        &self,
        tasks: &[Task],
        stores: &BTreeMap<String, Arc<MultiVersionStore>>,
        txs: &[T],
        handler: &F,
        start: TxIndex,
    ) -> Result<()>
    where
        F: Fn(&T, &mut TaskContext) -> Result<TaskOutput>,
    {
        for index in start..tasks.len() {
            let task = &tasks[index];

            if task.status() == TaskStatus::Validated {
                self.stats.record_validation();
                let (valid, conflicts) = Self::validate_across_stores(stores, index);
                if valid && conflicts.is_empty() {
                    continue;
                }
                self.stats.record_invalidation();
            }
            if matches!(task.status(), TaskStatus::Executed | TaskStatus::Validated) {
                task.bump_incarnation();
            }

            task.set_status(TaskStatus::Executing);
            let incarnation = task.incarnation();
            let mut ctx = TaskContext::new(index, incarnation, stores);
            match handler(&txs[index], &mut ctx) {
                Ok(output) => {
                    self.stats.record_execution();
                    for (name, view) in ctx.into_views() {
                        let (writeset, readset, iterateset) = view.finish();
                        if let Some(store) = stores.get(&name) {
                            store.publish(index, incarnation, writeset, readset, iterateset);
                        }
                    }
                    task.set_response(output);
                    task.set_status(TaskStatus::Validated);
                }
                Err(Error::ReadDependency { blocking }) => {
                    // Every lower index is settled before this one runs, so
                    // no estimate can be visible here.
                    return Err(Error::Internal(format!(
                        "task {index} hit an estimate from writer {blocking} during \
                         sequential execution"
                    )));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

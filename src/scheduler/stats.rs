//! Scheduler statistics - lock-free counters for batch execution
//!
//! Hot-path counters are single atomic increments on cache-line-aligned
//! slots so concurrent workers do not contend through false sharing.
//! Snapshots are taken with relaxed loads; they are monitoring data, not
//! synchronization points.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Aligned counter to avoid false sharing between adjacent counters.
#[repr(align(64))]
struct AlignedCounter(AtomicU64);

impl AlignedCounter {
    fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Scheduler Stats
// ============================================================================

/// Counters accumulated across all batches run by one scheduler.
pub struct SchedulerStats {
    /// Batches submitted.
    batches: AlignedCounter,
    /// Execute/validate waves run.
    waves: AlignedCounter,
    /// Completed task executions (all incarnations).
    executions: AlignedCounter,
    /// Executions abandoned after meeting an estimate.
    estimate_aborts: AlignedCounter,
    /// Validation passes over individual tasks.
    validations: AlignedCounter,
    /// Tasks invalidated and scheduled for re-execution.
    invalidations: AlignedCounter,
    /// Batches that hit the wave cap and finished sequentially.
    sequential_fallbacks: AlignedCounter,
}

impl SchedulerStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self {
            batches: AlignedCounter::new(),
            waves: AlignedCounter::new(),
            executions: AlignedCounter::new(),
            estimate_aborts: AlignedCounter::new(),
            validations: AlignedCounter::new(),
            invalidations: AlignedCounter::new(),
            sequential_fallbacks: AlignedCounter::new(),
        }
    }

    #[inline]
    pub(crate) fn record_batch(&self) {
        self.batches.incr();
    }

    #[inline]
    pub(crate) fn record_wave(&self) {
        self.waves.incr();
    }

    #[inline]
    pub(crate) fn record_execution(&self) {
        self.executions.incr();
    }

    #[inline]
    pub(crate) fn record_estimate_abort(&self) {
        self.estimate_aborts.incr();
    }

    #[inline]
    pub(crate) fn record_validation(&self) {
        self.validations.incr();
    }

    #[inline]
    pub(crate) fn record_invalidation(&self) {
        self.invalidations.incr();
    }

    #[inline]
    pub(crate) fn record_sequential_fallback(&self) {
        self.sequential_fallbacks.incr();
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.get(),
            waves: self.waves.get(),
            executions: self.executions.get(),
            estimate_aborts: self.estimate_aborts.get(),
            validations: self.validations.get(),
            invalidations: self.invalidations.get(),
            sequential_fallbacks: self.sequential_fallbacks.get(),
        }
    }
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copyable view of [`SchedulerStats`] at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches: u64,
    pub waves: u64,
    pub executions: u64,
    pub estimate_aborts: u64,
    pub validations: u64,
    pub invalidations: u64,
    pub sequential_fallbacks: u64,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = SchedulerStats::new();
        stats.record_batch();
        stats.record_execution();
        stats.record_execution();
        stats.record_invalidation();

        let snap = stats.snapshot();
        assert_eq!(snap.batches, 1);
        assert_eq!(snap.executions, 2);
        assert_eq!(snap.invalidations, 1);
        assert_eq!(snap.sequential_fallbacks, 0);
    }
}

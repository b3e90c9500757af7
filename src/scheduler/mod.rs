//! Scheduler subsystem - batch orchestration over the multiversion ledger
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              Scheduler                            │
//! │  - execute/validate waves on a worker pool       │
//! │  - conflict resolution in batch order            │
//! │  - wave cap with sequential fallback             │
//! │  - deterministic flush after convergence         │
//! ├──────────────────────────────────────────────────┤
//! │  Task                                            │
//! │  - status, incarnation, dependency set           │
//! │  - retained response per batch entry             │
//! ├──────────────────────────────────────────────────┤
//! │  SchedulerStats                                  │
//! │  - lock-free counters across batches             │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod manager;
pub mod stats;
pub mod task;


pub use manager::{BatchOutput, Scheduler, SchedulerConfig, DEFAULT_MAX_ITERATIONS};
pub use stats::{SchedulerStats, StatsSnapshot};
pub use task::{Task, TaskContext, TaskOutput, TaskStatus};

//! Parent store boundary - the committed state underneath a batch
//!
//! The execution engine never owns durable state. It reads through and
//! finally flushes into a parent store supplied by the caller:
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              KvStore (trait)                      │
//! │  - get / has / set / delete                      │
//! │  - lexicographic range cursors, both directions  │
//! ├──────────────────────────────────────────────────┤
//! │  MemoryStore                                     │
//! │  - RwLock<BTreeMap> reference implementation     │
//! │  - cursors snapshot the requested range          │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! During a batch the parent is read-only; the single mutation point is the
//! post-convergence flush performed by the scheduler.

pub mod kv;
pub mod memory;

pub use kv::{BoxedKvIterator, KvStore};
pub use memory::MemoryStore;

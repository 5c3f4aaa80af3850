//! # kagi-store
//!
//! Durable kernel state for Kagi. The [`KernelStore`] is the only mutator of
//! persistent state: object and promise tables with tagged reference counts,
//! per-endpoint c-lists, the FIFO run queue, the crank output buffer, GC and
//! reap action queues, vat/remote/subcluster records, and the vatstore.
//!
//! Storage itself is pluggable behind the [`KVStore`] trait: an ordered
//! string map with labeled savepoints. [`SqliteKVStore`] is the durable
//! implementation; [`MemoryKVStore`] backs tests and ephemeral kernels.

pub mod kv;
pub mod memory;
pub mod records;
#[cfg(debug_assertions)]
mod refcount;
pub mod sqlite;
pub mod store;

pub use kv::{KVError, KVStore};
pub use memory::MemoryKVStore;
pub use records::{KernelObject, KernelPromise, PromiseState};
pub use sqlite::SqliteKVStore;
pub use store::{CRANK_SAVEPOINT, DEFAULT_REAP_INTERVAL, KernelStore};

//! Durable partitioned key-value store.
//!
//! This module provides the storage foundation every other component is
//! built on:
//! - Named partitions (`entities`, `usage`, `versions`, `meta`, `outbox`)
//! - Schema-free JSON values with per-partition secondary indexes
//! - Atomic multi-write batches and single-key read-modify-write
//! - A SQLite backend for durability and an in-memory backend for degraded mode

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
  Direction, Index, Partition, PartitionStore, Scan, UpdateFn, UpdateWithFn, WriteOp,
};

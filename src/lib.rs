//! Local-first data layer for a clause library.
//!
//! Remote clause records are cached in a durable partitioned store and
//! served stale-while-revalidate. Uses are counted in a ledger, edits leave
//! immutable version snapshots, and writes that cannot reach the remote wait
//! in an outbox until they can.
//!
//! Everything hangs off one [`CacheEngine`] per session.

pub mod clock;
pub mod config;
pub mod detached;
pub mod engine;
pub mod entities;
pub mod error;
pub mod library;
pub mod loader;
pub mod metadata;
pub mod outbox;
pub mod remote;
pub mod store;
pub mod sync_worker;
pub mod usage;
pub mod versions;

#[cfg(test)]
mod testing;

pub use engine::{CacheEngine, CacheEngineBuilder};
pub use error::{CacheError, Result};
pub use library::{ClauseLibrary, Delivery, DocumentHost, LibraryOptions};

//! Embedded storage back-end for one farm replica.
//!
//! Each `(key, field)` lives in either the insert-projection or the
//! delete-projection of its key, stored as a packed
//! `{score, txn, expires_at, value}` record. Keys are routed to in-memory
//! shards; an optional WAL provides durability.

pub mod engine;
pub mod memtable;
pub mod record;
pub mod wal;

pub use engine::{StorageEngine, StorageError};
pub use record::{pack, unpack, StoredRecord};
pub use wal::FsyncPolicy;

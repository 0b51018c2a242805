//! SQLite storage layer for plugos.
//!
//! Provides the durable key/value table behind the `store.*` syscalls and
//! the query engine that evaluates filters, ordering and limits over it.
//!
//! # Architecture
//!
//! - Each store is one SQLite table of `(key TEXT PRIMARY KEY, value TEXT)`
//! - Values are schemaless JSON, persisted as text and decoded on read
//! - Queries scan a snapshot of the table and are evaluated in memory by
//!   [`QueryEngine`], so every filter works on any property without indexes
//! - Several stores may share one connection (one table each)

mod error;
mod kv_store;
pub mod query;

pub use error::{QueryError, StorageError, StorageResult};
pub use kv_store::{KvStore, ensure_table};
pub use query::{QueryEngine, QueryOptions};

//! Durable queue of writes that could not be delivered.
//!
//! Records live in a single versioned SQLite database so they survive
//! restarts. Every operation is its own unit of work; concurrent writers in
//! other processes are serialized by SQLite, not by this module.

mod schema;
mod store;

pub use schema::{DATABASE_FILE, SCHEMA_VERSION};
pub use store::{PendingWriteRecord, QueueStore};
pub(crate) use store::BUSY_TIMEOUT;

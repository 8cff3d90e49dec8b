//! Offline-first proxy for a small catalog API.
//!
//! Reads are answered from tiered caches when the origin is unreachable,
//! writes that cannot be delivered are queued in SQLite, and the queue is
//! replayed once connectivity returns.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod logging;
pub mod monitor;
pub mod notify;
pub mod pipeline;
pub mod proxy;
pub mod queue;
pub mod recorder;
pub mod server;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

//! Cache tiers for offline reads.
//!
//! This module provides:
//! - Three named generations (static, dynamic, immutable) in one SQLite file
//! - Atomic install of the static and immutable tiers from fixed manifests
//! - Activation-time purge of generations from older versions
//! - Lookup across all generations, plus named fallback assets

mod layer;
mod storage;
mod types;

pub use layer::CacheTierManager;
pub use storage::{CacheStorage, SqliteCacheStorage, CACHE_DATABASE_FILE};
pub use types::{CachedResponse, Fallback, Tier};

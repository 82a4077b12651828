//! Persistent local cache of transactions and notifications.
//!
//! This module provides the account-partitioned store the sync layer merges into:
//! - Caches records with a unique key and a recency ordering key
//! - Deduplicates by key on every merge, the most recently merged copy wins
//! - Writes each page atomically so readers never observe a torn page
//! - Tracks when each scope last synced successfully

mod layer;
mod storage;
mod traits;

pub use layer::{AccountUnbound, LocalCache};
pub use storage::{CacheStorage, CachedEntity, SqliteStorage};
pub use traits::Cacheable;

//! Read cache for API responses.
//!
//! Entries are bounded by a TTL and a schema version; a read that fails
//! either check evicts the entry and reports a miss, which callers treat as
//! "must refetch". Storage is pluggable:
//! - `SqliteStorage` persists into the cache collection of the durable store
//! - `NoopStorage` disables caching

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheKey, CacheResult, CacheSource};

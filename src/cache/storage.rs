//! Cache storage trait and implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use std::future::Future;
use tracing::warn;

use super::traits::CacheEntry;
use crate::store::{from_millis, to_millis, Store};

/// Trait for cache storage backends.
///
/// Backends store and return entries as written; freshness and version checks
/// belong to the [`super::CacheLayer`].
pub trait CacheStorage: Send + Sync {
  /// Insert or overwrite an entry.
  fn put(&self, entry: CacheEntry) -> impl Future<Output = Result<()>> + Send;

  /// Get the stored entry for `key`, expired or not.
  fn entry(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry>>> + Send;

  /// Delete one entry. Returns whether it existed.
  fn remove(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

  /// Delete every entry whose key contains `pattern`, or all entries.
  fn remove_matching(&self, pattern: Option<&str>) -> impl Future<Output = Result<u64>> + Send;

  /// Delete every entry whose expiry is at or before `now`.
  fn remove_expired(&self, now: DateTime<Utc>) -> impl Future<Output = Result<u64>> + Send;

  /// Every stored entry, oldest write first.
  fn entries(&self) -> impl Future<Output = Result<Vec<CacheEntry>>> + Send;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  async fn put(&self, _entry: CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  async fn entry(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  async fn remove(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  async fn remove_matching(&self, _pattern: Option<&str>) -> Result<u64> {
    Ok(0)
  }

  async fn remove_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
    Ok(0)
  }

  async fn entries(&self) -> Result<Vec<CacheEntry>> {
    Ok(Vec::new())
  }
}

/// Cache collection of the durable store.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
  store: Store,
}

impl SqliteStorage {
  pub fn new(store: Store) -> Self {
    Self { store }
  }
}

/// Raw row; `data` is parsed separately so a corrupt entry can be evicted
/// instead of failing the read.
struct CacheRow {
  key: String,
  data: String,
  timestamp: i64,
  expires_at: i64,
  schema_version: u32,
}

impl CacheRow {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key: row.get(0)?,
      data: row.get(1)?,
      timestamp: row.get(2)?,
      expires_at: row.get(3)?,
      schema_version: row.get(4)?,
    })
  }

  fn into_entry(self) -> Result<CacheEntry, serde_json::Error> {
    Ok(CacheEntry {
      data: serde_json::from_str(&self.data)?,
      key: self.key,
      timestamp: from_millis(self.timestamp),
      expires_at: from_millis(self.expires_at),
      schema_version: self.schema_version,
    })
  }
}

const SELECT_ENTRIES: &str = "SELECT key, data, timestamp, expires_at, schema_version FROM cache";

impl CacheStorage for SqliteStorage {
  async fn put(&self, entry: CacheEntry) -> Result<()> {
    self
      .store
      .call(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO cache (key, data, timestamp, expires_at, schema_version)
             VALUES (?, ?, ?, ?, ?)",
            params![
              entry.key,
              entry.data.to_string(),
              to_millis(entry.timestamp),
              to_millis(entry.expires_at),
              entry.schema_version,
            ],
          )
          .map_err(|e| eyre!("Failed to cache {}: {}", entry.key, e))?;
        Ok(())
      })
      .await
  }

  async fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
    self
      .store
      .call(|conn| {
        let row = conn
          .query_row(
            &format!("{} WHERE key = ?", SELECT_ENTRIES),
            params![key],
            CacheRow::read,
          )
          .optional()
          .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

        let Some(row) = row else {
          return Ok(None);
        };

        match row.into_entry() {
          Ok(entry) => Ok(Some(entry)),
          Err(e) => {
            warn!(key, error = %e, "Evicting unreadable cache entry");
            conn
              .execute("DELETE FROM cache WHERE key = ?", params![key])
              .map_err(|e| eyre!("Failed to evict cache entry {}: {}", key, e))?;
            Ok(None)
          }
        }
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<bool> {
    self
      .store
      .call(|conn| {
        let removed = conn
          .execute("DELETE FROM cache WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to evict cache entry {}: {}", key, e))?;
        Ok(removed > 0)
      })
      .await
  }

  async fn remove_matching(&self, pattern: Option<&str>) -> Result<u64> {
    self
      .store
      .call(|conn| {
        // instr() matches the pattern literally, unlike LIKE with its wildcards
        let removed = match pattern {
          Some(pattern) => conn.execute("DELETE FROM cache WHERE instr(key, ?) > 0", params![pattern]),
          None => conn.execute("DELETE FROM cache", []),
        }
        .map_err(|e| eyre!("Failed to invalidate cache: {}", e))?;
        Ok(removed as u64)
      })
      .await
  }

  async fn remove_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    self
      .store
      .call(move |conn| {
        let removed = conn
          .execute("DELETE FROM cache WHERE expires_at <= ?", params![to_millis(now)])
          .map_err(|e| eyre!("Failed to sweep expired cache entries: {}", e))?;
        Ok(removed as u64)
      })
      .await
  }

  async fn entries(&self) -> Result<Vec<CacheEntry>> {
    self
      .store
      .call(|conn| {
        let mut stmt = conn
          .prepare(&format!("{} ORDER BY timestamp, key", SELECT_ENTRIES))
          .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

        let rows = stmt
          .query_map([], CacheRow::read)
          .map_err(|e| eyre!("Failed to list cache entries: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read cache row: {}", e))?;

        // Unreadable rows are skipped here and evicted by the next `entry` read
        Ok(rows.into_iter().filter_map(|r| r.into_entry().ok()).collect())
      })
      .await
  }
}

//! Durable store shared by every offline component.
//!
//! One SQLite file holds the named collections (queue, cache, sync status,
//! user data, binary assets). The connection is opened lazily on first use and
//! kept for the lifetime of the handle; every accessor awaits it, so callers
//! never need to initialize the store up front.

pub mod assets;
pub(crate) mod schema;
pub mod user_data;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

pub use assets::{Asset, AssetInfo, AssetStore};
pub use schema::SCHEMA_VERSION;
pub use user_data::UserData;

/// A logical collection inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
  Queue,
  Cache,
  SyncStatus,
  UserData,
  Assets,
}

impl Collection {
  pub const ALL: [Collection; 5] = [
    Collection::Queue,
    Collection::Cache,
    Collection::SyncStatus,
    Collection::UserData,
    Collection::Assets,
  ];

  pub fn table(&self) -> &'static str {
    match self {
      Collection::Queue => "queue",
      Collection::Cache => "cache",
      Collection::SyncStatus => "sync_status",
      Collection::UserData => "user_data",
      Collection::Assets => "assets",
    }
  }

  /// SQL expression approximating the stored payload size of the collection.
  fn size_expr(&self) -> &'static str {
    match self {
      Collection::Queue => "SUM(length(id) + length(operation) + COALESCE(length(metadata), 0))",
      Collection::Cache => "SUM(length(key) + length(data))",
      Collection::SyncStatus => {
        "SUM(length(key) + COALESCE(length(error), 0) + COALESCE(length(snapshot), 0))"
      }
      Collection::UserData => "SUM(length(key) + length(value))",
      Collection::Assets => "SUM(length(key) + length(bytes))",
    }
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.table())
  }
}

/// Item count and approximate size of one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
  pub collection: Collection,
  pub items: u64,
  pub approx_bytes: u64,
}

/// Storage usage across every collection, for display only.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
  pub collections: Vec<CollectionStats>,
}

impl StorageStats {
  pub fn total_items(&self) -> u64 {
    self.collections.iter().map(|c| c.items).sum()
  }

  pub fn total_bytes(&self) -> u64 {
    self.collections.iter().map(|c| c.approx_bytes).sum()
  }

  pub fn get(&self, collection: Collection) -> Option<&CollectionStats> {
    self.collections.iter().find(|c| c.collection == collection)
  }
}

#[derive(Debug)]
enum Location {
  File(PathBuf),
  Memory,
}

struct Inner {
  location: Location,
  conn: OnceCell<Mutex<Connection>>,
}

/// Handle to the durable store.
///
/// Cloning is cheap; clones share the same connection. Construct one per
/// process (or per test) and inject it into the components that need it.
#[derive(Clone)]
pub struct Store {
  inner: Arc<Inner>,
}

impl Store {
  /// Store backed by the file at `path`. Nothing is opened until first use.
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self::with_location(Location::File(path.into()))
  }

  /// Store backed by a private in-memory database.
  pub fn in_memory() -> Self {
    Self::with_location(Location::Memory)
  }

  /// Store at the default data location.
  pub fn open_default() -> Result<Self> {
    Ok(Self::at(Self::default_path()?))
  }

  fn with_location(location: Location) -> Self {
    Self {
      inner: Arc::new(Inner {
        location,
        conn: OnceCell::new(),
      }),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("agrosync").join("store.db"))
  }

  /// File backing this store, if any.
  pub fn path(&self) -> Option<&Path> {
    match &self.inner.location {
      Location::File(path) => Some(path),
      Location::Memory => None,
    }
  }

  async fn handle(&self) -> Result<&Mutex<Connection>> {
    self
      .inner
      .conn
      .get_or_try_init(|| async { self.open_connection().map(Mutex::new) })
      .await
  }

  fn open_connection(&self) -> Result<Connection> {
    let mut conn = match &self.inner.location {
      Location::File(path) => {
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
        }

        let conn = Connection::open(path)
          .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;
        conn
          .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
          .map_err(|e| eyre!("Failed to enable WAL journal: {}", e))?;
        conn
      }
      Location::Memory => Connection::open_in_memory()
        .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?,
    };

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    let version = schema::migrate(&mut conn)?;
    debug!(location = ?self.inner.location, version, "Opened store");

    Ok(conn)
  }

  /// Run `f` against the connection, serialized with every other operation.
  pub async fn call<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Connection) -> Result<T> + Send,
    T: Send,
  {
    let conn = self.handle().await?.lock().await;
    f(&conn)
  }

  /// Run `f` inside one transaction spanning any number of collections.
  ///
  /// Commits when `f` returns `Ok`; any other exit rolls back.
  pub async fn transaction<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T> + Send,
    T: Send,
  {
    let mut conn = self.handle().await?.lock().await;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let value = f(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(value)
  }

  /// Schema version of the opened store.
  pub async fn schema_version(&self) -> Result<u32> {
    self.call(schema::current_version).await
  }

  pub async fn count(&self, collection: Collection) -> Result<u64> {
    self
      .call(move |conn| {
        let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
        conn
          .query_row(&sql, [], |row| row.get(0))
          .map_err(|e| eyre!("Failed to count {}: {}", collection, e))
      })
      .await
  }

  /// Empty one collection without touching the others.
  pub async fn clear(&self, collection: Collection) -> Result<()> {
    self
      .call(move |conn| {
        conn
          .execute(&format!("DELETE FROM {}", collection.table()), [])
          .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;
        Ok(())
      })
      .await
  }

  /// Empty every collection in a single transaction.
  pub async fn clear_all(&self) -> Result<()> {
    self
      .transaction(|tx| {
        for collection in Collection::ALL {
          tx.execute(&format!("DELETE FROM {}", collection.table()), [])
            .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;
        }
        Ok(())
      })
      .await?;

    debug!("Cleared all collections");
    Ok(())
  }

  pub async fn storage_stats(&self) -> Result<StorageStats> {
    self
      .call(|conn| {
        let mut collections = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
          let sql = format!(
            "SELECT COUNT(*), COALESCE({}, 0) FROM {}",
            collection.size_expr(),
            collection.table()
          );
          let (items, approx_bytes): (u64, u64) = conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| eyre!("Failed to measure {}: {}", collection, e))?;
          collections.push(CollectionStats {
            collection,
            items,
            approx_bytes,
          });
        }
        Ok(StorageStats { collections })
      })
      .await
  }
}

impl fmt::Debug for Store {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Store")
      .field("location", &self.inner.location)
      .field("open", &self.inner.conn.initialized())
      .finish()
  }
}

/// Timestamps are stored as Unix milliseconds so index range scans stay exact.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `at + delta`, clamped to the representable range instead of overflowing.
pub(crate) fn saturating_add(at: DateTime<Utc>, delta: chrono::Duration) -> DateTime<Utc> {
  at.checked_add_signed(delta).unwrap_or(if delta < chrono::Duration::zero() {
    DateTime::<Utc>::MIN_UTC
  } else {
    DateTime::<Utc>::MAX_UTC
  })
}

/// Convert a column value that failed to parse into a rusqlite error.
pub(crate) fn conversion_error(
  index: usize,
  err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

/// Read a JSON text column into `T`.
pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
  row: &rusqlite::Row<'_>,
  index: usize,
) -> rusqlite::Result<T> {
  let text: String = row.get(index)?;
  serde_json::from_str(&text).map_err(|e| conversion_error(index, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_saturating_add_clamps() {
    let now = Utc::now();

    assert_eq!(saturating_add(now, chrono::Duration::MAX), DateTime::<Utc>::MAX_UTC);
    assert_eq!(saturating_add(now, chrono::Duration::MIN), DateTime::<Utc>::MIN_UTC);
    assert_eq!(
      saturating_add(now, chrono::Duration::minutes(1)),
      now + chrono::Duration::minutes(1)
    );

    let far = to_millis(saturating_add(now, chrono::Duration::MAX));
    assert_eq!(to_millis(from_millis(far)), far);
  }

  #[tokio::test]
  async fn test_store_opens_lazily() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    let store = Store::at(&path);

    assert!(!path.exists());
    assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
    assert!(path.exists());
  }

  #[tokio::test]
  async fn test_clones_share_one_connection() {
    let store = Store::in_memory();
    let other = store.clone();

    store
      .call(|conn| {
        conn.execute(
          "INSERT INTO user_data (namespace, key, value, updated_at) VALUES ('user', 'k', '1', 0)",
          [],
        )?;
        Ok(())
      })
      .await
      .unwrap();

    assert_eq!(other.count(Collection::UserData).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failed_transaction_rolls_back() {
    let store = Store::in_memory();

    let result: Result<()> = store
      .transaction(|tx| {
        tx.execute(
          "INSERT INTO user_data (namespace, key, value, updated_at) VALUES ('user', 'k', '1', 0)",
          [],
        )?;
        Err(eyre!("boom"))
      })
      .await;

    assert!(result.is_err());
    assert_eq!(store.count(Collection::UserData).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_clear_all_is_idempotent() {
    let store = Store::in_memory();
    store
      .call(|conn| {
        conn.execute(
          "INSERT INTO cache (key, data, timestamp, expires_at) VALUES ('k', '{}', 0, 1)",
          [],
        )?;
        Ok(())
      })
      .await
      .unwrap();

    store.clear_all().await.unwrap();
    let first = store.storage_stats().await.unwrap();
    store.clear_all().await.unwrap();
    let second = store.storage_stats().await.unwrap();

    assert_eq!(first.total_items(), 0);
    assert_eq!(second.total_items(), 0);
    assert_eq!(first.total_bytes(), second.total_bytes());
  }

  #[tokio::test]
  async fn test_clear_leaves_other_collections() {
    let store = Store::in_memory();
    store
      .call(|conn| {
        conn.execute(
          "INSERT INTO cache (key, data, timestamp, expires_at) VALUES ('k', '{}', 0, 1)",
          [],
        )?;
        conn.execute(
          "INSERT INTO user_data (namespace, key, value, updated_at) VALUES ('user', 'k', '1', 0)",
          [],
        )?;
        Ok(())
      })
      .await
      .unwrap();

    store.clear(Collection::Cache).await.unwrap();

    assert_eq!(store.count(Collection::Cache).await.unwrap(), 0);
    assert_eq!(store.count(Collection::UserData).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_storage_stats_reports_sizes() {
    let store = Store::in_memory();
    store
      .call(|conn| {
        conn.execute(
          "INSERT INTO cache (key, data, timestamp, expires_at) VALUES ('key', '{\"a\":1}', 0, 1)",
          [],
        )?;
        Ok(())
      })
      .await
      .unwrap();

    let stats = store.storage_stats().await.unwrap();
    let cache = stats.get(Collection::Cache).unwrap();

    assert_eq!(cache.items, 1);
    assert_eq!(cache.approx_bytes, 3 + 7);
    assert_eq!(stats.collections.len(), 5);
  }
}

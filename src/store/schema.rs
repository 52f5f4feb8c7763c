//! Versioned schema for the offline store.
//!
//! The version lives in `PRAGMA user_version`. Every step is additive so an
//! older file is upgraded in place without discarding compatible data.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use tracing::info;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// Outbound queue, read cache and per-item sync status.
pub(crate) const V1: &str = r#"
CREATE TABLE IF NOT EXISTS queue (
    id TEXT PRIMARY KEY,
    resource_type TEXT NOT NULL,
    priority INTEGER NOT NULL,
    operation TEXT NOT NULL,
    metadata TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_created ON queue(created_at);
CREATE INDEX IF NOT EXISTS idx_queue_priority ON queue(priority, created_at);

CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    schema_version INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_cache_timestamp ON cache(timestamp);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache(expires_at);

CREATE TABLE IF NOT EXISTS sync_status (
    key TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_attempt INTEGER NOT NULL,
    next_retry INTEGER,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_status_status ON sync_status(status);
CREATE INDEX IF NOT EXISTS idx_sync_status_last ON sync_status(last_attempt);
"#;

/// User data, binary assets, and resource/snapshot tracking on sync status.
pub(crate) const V2: &str = r#"
ALTER TABLE sync_status ADD COLUMN resource_type TEXT;
ALTER TABLE sync_status ADD COLUMN snapshot TEXT;

CREATE INDEX IF NOT EXISTS idx_sync_status_resource ON sync_status(resource_type, status);

CREATE TABLE IF NOT EXISTS user_data (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS assets (
    key TEXT PRIMARY KEY,
    content_type TEXT NOT NULL,
    bytes BLOB NOT NULL,
    sha256 TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_created ON assets(created_at);
"#;

const MIGRATIONS: &[(u32, &str)] = &[(1, V1), (2, V2)];

/// Read the on-disk schema version.
pub(crate) fn current_version(conn: &Connection) -> Result<u32> {
  conn
    .pragma_query_value(None, "user_version", |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))
}

/// Bring the schema up to [`SCHEMA_VERSION`], applying only the missing steps.
pub(crate) fn migrate(conn: &mut Connection) -> Result<u32> {
  let current = current_version(conn)?;

  if current > SCHEMA_VERSION {
    return Err(eyre!(
      "Store schema version {} is newer than this build supports ({})",
      current,
      SCHEMA_VERSION
    ));
  }
  if current == SCHEMA_VERSION {
    return Ok(current);
  }

  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin migration: {}", e))?;

  for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
    tx.execute_batch(sql)
      .map_err(|e| eyre!("Failed to apply schema version {}: {}", version, e))?;
    info!(version, "Applied store migration");
  }

  tx.pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
  tx.commit()
    .map_err(|e| eyre!("Failed to commit migration: {}", e))?;

  Ok(SCHEMA_VERSION)
}

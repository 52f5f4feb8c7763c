//! Binary assets (harvest photos, scanned documents) kept for offline upload.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{from_millis, to_millis, Store};

/// Metadata for a stored asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetInfo {
  pub key: String,
  pub content_type: String,
  pub size: u64,
  /// Hex-encoded SHA-256 of the bytes
  pub sha256: String,
  pub created_at: DateTime<Utc>,
}

/// An asset together with its bytes.
#[derive(Debug, Clone)]
pub struct Asset {
  pub info: AssetInfo,
  pub bytes: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct AssetStore {
  store: Store,
}

fn digest(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

fn read_info(row: &Row<'_>) -> rusqlite::Result<AssetInfo> {
  Ok(AssetInfo {
    key: row.get(0)?,
    content_type: row.get(1)?,
    size: row.get(2)?,
    sha256: row.get(3)?,
    created_at: from_millis(row.get(4)?),
  })
}

impl AssetStore {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  /// Store `bytes` under `key`, replacing any previous asset.
  pub async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<AssetInfo> {
    let info = AssetInfo {
      key: key.to_string(),
      content_type: content_type.to_string(),
      size: bytes.len() as u64,
      sha256: digest(bytes),
      // Millisecond precision, matching what is read back
      created_at: from_millis(to_millis(Utc::now())),
    };

    self
      .store
      .call(|conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO assets (key, content_type, bytes, sha256, size, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
              info.key,
              info.content_type,
              bytes,
              info.sha256,
              info.size,
              to_millis(info.created_at)
            ],
          )
          .map_err(|e| eyre!("Failed to store asset {}: {}", key, e))?;
        Ok(())
      })
      .await?;

    Ok(info)
  }

  /// Fetch an asset, verifying its digest.
  pub async fn get(&self, key: &str) -> Result<Option<Asset>> {
    let stored = self
      .store
      .call(|conn| {
        conn
          .query_row(
            "SELECT key, content_type, size, sha256, created_at, bytes FROM assets WHERE key = ?",
            params![key],
            |row| Ok((read_info(row)?, row.get::<_, Vec<u8>>(5)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read asset {}: {}", key, e))
      })
      .await?;

    let Some((info, bytes)) = stored else {
      return Ok(None);
    };

    let actual = digest(&bytes);
    if actual != info.sha256 {
      return Err(eyre!(
        "Asset {} is corrupt: expected sha256 {}, found {}",
        key,
        info.sha256,
        actual
      ));
    }

    Ok(Some(Asset { info, bytes }))
  }

  pub async fn delete(&self, key: &str) -> Result<bool> {
    self
      .store
      .call(|conn| {
        let removed = conn
          .execute("DELETE FROM assets WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete asset {}: {}", key, e))?;
        Ok(removed > 0)
      })
      .await
  }

  /// Metadata of every asset, oldest first.
  pub async fn list(&self) -> Result<Vec<AssetInfo>> {
    self
      .store
      .call(|conn| {
        let mut stmt = conn
          .prepare(
            "SELECT key, content_type, size, sha256, created_at FROM assets ORDER BY created_at, key",
          )
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let assets = stmt
          .query_map([], read_info)
          .map_err(|e| eyre!("Failed to list assets: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read asset row: {}", e))?;
        Ok(assets)
      })
      .await
  }
}

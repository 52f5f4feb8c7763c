//! Namespaced key/value JSON records.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::{from_millis, json_column, to_millis, Store};

pub(crate) const USER_NAMESPACE: &str = "user";

/// Arbitrary user-owned records (profile drafts, preferences, form state).
#[derive(Clone, Debug)]
pub struct UserData {
  store: Store,
}

impl UserData {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let value =
      serde_json::to_value(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self
      .store
      .call(|conn| put_value(conn, USER_NAMESPACE, key, &value, Utc::now()))
      .await
  }

  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    let stored = self
      .store
      .call(|conn| get_value(conn, USER_NAMESPACE, key))
      .await?;

    stored
      .map(|(value, _)| {
        serde_json::from_value(value).map_err(|e| eyre!("Failed to deserialize {}: {}", key, e))
      })
      .transpose()
  }

  pub async fn delete(&self, key: &str) -> Result<bool> {
    self
      .store
      .call(|conn| delete_value(conn, USER_NAMESPACE, key))
      .await
  }

  pub async fn keys(&self) -> Result<Vec<String>> {
    let records = self
      .store
      .call(|conn| list_values(conn, USER_NAMESPACE))
      .await?;
    Ok(records.into_iter().map(|(key, _, _)| key).collect())
  }
}

pub(crate) fn put_value(
  conn: &Connection,
  namespace: &str,
  key: &str,
  value: &Value,
  now: DateTime<Utc>,
) -> Result<()> {
  conn
    .execute(
      "INSERT OR REPLACE INTO user_data (namespace, key, value, updated_at) VALUES (?, ?, ?, ?)",
      params![namespace, key, value.to_string(), to_millis(now)],
    )
    .map_err(|e| eyre!("Failed to store {}/{}: {}", namespace, key, e))?;
  Ok(())
}

pub(crate) fn get_value(
  conn: &Connection,
  namespace: &str,
  key: &str,
) -> Result<Option<(Value, DateTime<Utc>)>> {
  conn
    .query_row(
      "SELECT value, updated_at FROM user_data WHERE namespace = ? AND key = ?",
      params![namespace, key],
      |row| Ok((json_column(row, 0)?, from_millis(row.get(1)?))),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read {}/{}: {}", namespace, key, e))
}

pub(crate) fn delete_value(conn: &Connection, namespace: &str, key: &str) -> Result<bool> {
  let removed = conn
    .execute(
      "DELETE FROM user_data WHERE namespace = ? AND key = ?",
      params![namespace, key],
    )
    .map_err(|e| eyre!("Failed to delete {}/{}: {}", namespace, key, e))?;
  Ok(removed > 0)
}

pub(crate) fn list_values(
  conn: &Connection,
  namespace: &str,
) -> Result<Vec<(String, Value, DateTime<Utc>)>> {
  let mut stmt = conn
    .prepare("SELECT key, value, updated_at FROM user_data WHERE namespace = ? ORDER BY key")
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let rows = stmt
    .query_map(params![namespace], |row| {
      Ok((row.get(0)?, json_column(row, 1)?, from_millis(row.get(2)?)))
    })
    .map_err(|e| eyre!("Failed to list {}: {}", namespace, e))?
    .collect::<rusqlite::Result<Vec<_>>>()
    .map_err(|e| eyre!("Failed to read {} row: {}", namespace, e))?;

  Ok(rows)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Draft {
    crop: String,
    bags: u32,
  }

  #[tokio::test]
  async fn test_put_get_delete() {
    let data = UserData::new(Store::in_memory());
    let draft = Draft {
      crop: "maize".to_string(),
      bags: 12,
    };

    data.put("harvest-draft", &draft).await.unwrap();
    assert_eq!(data.get::<Draft>("harvest-draft").await.unwrap(), Some(draft));
    assert_eq!(data.keys().await.unwrap(), vec!["harvest-draft".to_string()]);

    assert!(data.delete("harvest-draft").await.unwrap());
    assert!(!data.delete("harvest-draft").await.unwrap());
    assert_eq!(data.get::<Draft>("harvest-draft").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_namespaces_are_isolated() {
    let store = Store::in_memory();
    let data = UserData::new(store.clone());

    store
      .call(|conn| put_value(conn, "capability", "scan", &Value::Bool(true), Utc::now()))
      .await
      .unwrap();

    assert!(data.keys().await.unwrap().is_empty());
    assert_eq!(data.get::<bool>("scan").await.unwrap(), None);
  }
}

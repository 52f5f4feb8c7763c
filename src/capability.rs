//! Registry of features promised to work offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;

use crate::store::user_data::{get_value, list_values, put_value};
use crate::store::Store;

const CAPABILITY_NAMESPACE: &str = "capability";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityFlag {
  pub feature: String,
  pub enabled: bool,
  pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct CapabilityRegistry {
  store: Store,
}

impl CapabilityRegistry {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  pub async fn set_capability(&self, feature: &str, enabled: bool) -> Result<()> {
    self
      .store
      .call(|conn| {
        put_value(
          conn,
          CAPABILITY_NAMESPACE,
          feature,
          &Value::Bool(enabled),
          Utc::now(),
        )
      })
      .await
  }

  /// Unknown features are reported as disabled.
  pub async fn is_enabled(&self, feature: &str) -> Result<bool> {
    let stored = self
      .store
      .call(|conn| get_value(conn, CAPABILITY_NAMESPACE, feature))
      .await?;
    Ok(matches!(stored, Some((Value::Bool(true), _))))
  }

  pub async fn list(&self) -> Result<Vec<CapabilityFlag>> {
    let records = self
      .store
      .call(|conn| list_values(conn, CAPABILITY_NAMESPACE))
      .await?;

    records
      .into_iter()
      .map(|(feature, value, timestamp)| match value {
        Value::Bool(enabled) => Ok(CapabilityFlag {
          feature,
          enabled,
          timestamp,
        }),
        other => Err(eyre!("Capability {} holds a non-boolean value: {}", feature, other)),
      })
      .collect()
  }
}

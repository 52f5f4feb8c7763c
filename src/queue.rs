//! Durable queue of outbound mutations.
//!
//! The queue never touches the network. Its only failure mode is the store
//! itself being unavailable, which is surfaced to the caller.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use tracing::warn;

use crate::model::{
  new_item_id, EnqueueOptions, Operation, Priority, QueueItem, ResourceType, ValidationError,
};
use crate::store::{from_millis, to_millis, Collection, Store};

/// Default retry budgets applied when a caller does not pass one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
  pub default_max_retries: u32,
  /// Financial writes get a larger budget
  pub payment_max_retries: u32,
}

impl Default for QueueDefaults {
  fn default() -> Self {
    Self {
      default_max_retries: 3,
      payment_max_retries: 5,
    }
  }
}

impl QueueDefaults {
  pub fn max_retries_for(&self, resource_type: ResourceType) -> u32 {
    match resource_type {
      ResourceType::Payment => self.payment_max_retries,
      _ => self.default_max_retries,
    }
  }
}

/// Result of charging one failed attempt against an item's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryCharge {
  pub retry_count: u32,
  pub max_retries: u32,
  /// False once the budget is spent; the row has then been deleted
  pub still_eligible: bool,
}

#[derive(Clone, Debug)]
pub struct MutationQueue {
  store: Store,
  defaults: QueueDefaults,
}

impl MutationQueue {
  pub fn new(store: Store) -> Self {
    Self {
      store,
      defaults: QueueDefaults::default(),
    }
  }

  pub fn with_defaults(mut self, defaults: QueueDefaults) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn defaults(&self) -> QueueDefaults {
    self.defaults
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  /// Validate `operation` and build the item that `enqueue` would persist.
  pub fn prepare(
    &self,
    operation: Operation,
    options: EnqueueOptions,
  ) -> Result<QueueItem, ValidationError> {
    operation.validate()?;

    // Stored timestamps keep millisecond precision
    let now = from_millis(to_millis(Utc::now()));
    let resource_type = operation.resource_type();
    Ok(QueueItem {
      id: new_item_id(resource_type, now),
      priority: options.priority.unwrap_or_default(),
      created_at: now,
      retry_count: 0,
      max_retries: options
        .max_retries
        .unwrap_or_else(|| self.defaults.max_retries_for(resource_type)),
      metadata: options.metadata,
      operation,
    })
  }

  /// Persist a new mutation and return its id.
  pub async fn enqueue(&self, operation: Operation, options: EnqueueOptions) -> Result<String> {
    let item = self.prepare(operation, options)?;
    self.store.call(|conn| insert(conn, &item)).await?;
    Ok(item.id)
  }

  pub async fn get(&self, id: &str) -> Result<Option<QueueItem>> {
    self.store.call(|conn| get(conn, id)).await
  }

  /// Every queued item.
  ///
  /// Priority order is high, medium, low with the oldest first inside a rank;
  /// otherwise items come back in enqueue order.
  pub async fn dequeue_all(&self, order_by_priority: bool) -> Result<Vec<QueueItem>> {
    let sql = format!("{} {}", SELECT_ITEMS, order_clause(order_by_priority));
    self
      .store
      .call(move |conn| select(conn, &sql, params![]))
      .await
  }

  pub async fn by_priority(&self, priority: Priority) -> Result<Vec<QueueItem>> {
    self
      .store
      .call(move |conn| {
        select(
          conn,
          &format!("{} WHERE priority = ? ORDER BY created_at, id", SELECT_ITEMS),
          params![priority.rank()],
        )
      })
      .await
  }

  /// Items enqueued in `[from, to)`, oldest first.
  pub async fn created_between(
    &self,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
  ) -> Result<Vec<QueueItem>> {
    self
      .store
      .call(move |conn| {
        select(
          conn,
          &format!(
            "{} WHERE created_at >= ? AND created_at < ? ORDER BY created_at, id",
            SELECT_ITEMS
          ),
          params![to_millis(from), to_millis(to)],
        )
      })
      .await
  }

  /// Delete an item after confirmed delivery. Returns whether it existed.
  pub async fn remove(&self, id: &str) -> Result<bool> {
    self.store.call(|conn| delete(conn, id)).await
  }

  /// Charge one failed attempt against the item's retry budget.
  ///
  /// Returns `false` when the budget is spent; the item has then been removed
  /// and the caller owns writing its terminal status.
  pub async fn bump_retry(&self, id: &str) -> Result<bool> {
    let charge = self.store.transaction(|tx| charge_retry(tx, id)).await?;
    Ok(charge.map(|c| c.still_eligible).unwrap_or(false))
  }

  pub async fn len(&self) -> Result<u64> {
    self.store.count(Collection::Queue).await
  }

  pub async fn is_empty(&self) -> Result<bool> {
    Ok(self.len().await? == 0)
  }
}

const SELECT_ITEMS: &str =
  "SELECT id, resource_type, operation, priority, created_at, retry_count, max_retries, metadata FROM queue";

/// A queue row whose stored fields no longer decode into a [`QueueItem`],
/// e.g. one written by an older build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnreadableItem {
  pub id: String,
  pub resource_type: Option<ResourceType>,
  pub error: String,
}

/// Queue row as stored; decoded separately so one bad row cannot fail a scan.
struct RawItem {
  id: String,
  resource_type: String,
  operation: String,
  priority: i64,
  created_at: i64,
  retry_count: i64,
  max_retries: i64,
  metadata: Option<String>,
}

impl RawItem {
  fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      resource_type: row.get(1)?,
      operation: row.get(2)?,
      priority: row.get(3)?,
      created_at: row.get(4)?,
      retry_count: row.get(5)?,
      max_retries: row.get(6)?,
      metadata: row.get(7)?,
    })
  }

  fn decode(self) -> Result<QueueItem, UnreadableItem> {
    let unreadable = |id: &str, resource: &str, error: String| UnreadableItem {
      id: id.to_string(),
      resource_type: resource.parse().ok(),
      error,
    };

    let operation: Operation = serde_json::from_str(&self.operation).map_err(|e| {
      unreadable(&self.id, &self.resource_type, format!("operation: {}", e))
    })?;
    let priority = Priority::from_rank(self.priority).ok_or_else(|| {
      unreadable(
        &self.id,
        &self.resource_type,
        format!("unknown priority rank {}", self.priority),
      )
    })?;
    let metadata = self
      .metadata
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(|e| unreadable(&self.id, &self.resource_type, format!("metadata: {}", e)))?;
    let count = |name: &str, value: i64| {
      u32::try_from(value)
        .map_err(|_| unreadable(&self.id, &self.resource_type, format!("{} {}", name, value)))
    };

    Ok(QueueItem {
      retry_count: count("retry_count", self.retry_count)?,
      max_retries: count("max_retries", self.max_retries)?,
      created_at: from_millis(self.created_at),
      id: self.id,
      operation,
      priority,
      metadata,
    })
  }
}

fn select_raw<P: rusqlite::Params>(
  conn: &Connection,
  sql: &str,
  params: P,
) -> Result<Vec<RawItem>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

  let rows = stmt
    .query_map(params, RawItem::read)
    .map_err(|e| eyre!("Failed to query queue: {}", e))?
    .collect::<rusqlite::Result<Vec<_>>>()
    .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

  Ok(rows)
}

/// Decodable items only; unreadable rows are logged and left for the
/// processor to retire.
fn select<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<QueueItem>> {
  let items = select_raw(conn, sql, params)?
    .into_iter()
    .filter_map(|raw| match raw.decode() {
      Ok(item) => Some(item),
      Err(bad) => {
        warn!(id = %bad.id, error = %bad.error, "Skipping unreadable queue item");
        None
      }
    })
    .collect();
  Ok(items)
}

/// Every row in drain order, decoded or not.
pub(crate) fn scan(
  conn: &Connection,
  order_by_priority: bool,
) -> Result<Vec<Result<QueueItem, UnreadableItem>>> {
  let sql = format!("{} {}", SELECT_ITEMS, order_clause(order_by_priority));
  let rows = select_raw(conn, &sql, params![])?;
  Ok(rows.into_iter().map(RawItem::decode).collect())
}

fn order_clause(order_by_priority: bool) -> &'static str {
  if order_by_priority {
    "ORDER BY priority, created_at, id"
  } else {
    "ORDER BY created_at, id"
  }
}

pub(crate) fn insert(conn: &Connection, item: &QueueItem) -> Result<()> {
  let operation = serde_json::to_string(&item.operation)
    .map_err(|e| eyre!("Failed to serialize operation: {}", e))?;
  let metadata = item.metadata.as_ref().map(|m| m.to_string());

  conn
    .execute(
      "INSERT INTO queue (id, resource_type, priority, operation, metadata, retry_count, max_retries, created_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        item.id,
        item.resource_type().as_str(),
        item.priority.rank(),
        operation,
        metadata,
        item.retry_count,
        item.max_retries,
        to_millis(item.created_at),
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue {}: {}", item.id, e))?;

  Ok(())
}

pub(crate) fn get(conn: &Connection, id: &str) -> Result<Option<QueueItem>> {
  let raw = conn
    .query_row(
      &format!("{} WHERE id = ?", SELECT_ITEMS),
      params![id],
      RawItem::read,
    )
    .optional()
    .map_err(|e| eyre!("Failed to read queue item {}: {}", id, e))?;

  raw
    .map(RawItem::decode)
    .transpose()
    .map_err(|bad| eyre!("Queue item {} is unreadable: {}", bad.id, bad.error))
}

pub(crate) fn exists(conn: &Connection, id: &str) -> Result<bool> {
  conn
    .query_row("SELECT 1 FROM queue WHERE id = ?", params![id], |_| Ok(()))
    .optional()
    .map(|row| row.is_some())
    .map_err(|e| eyre!("Failed to look up queue item {}: {}", id, e))
}

pub(crate) fn delete(conn: &Connection, id: &str) -> Result<bool> {
  let removed = conn
    .execute("DELETE FROM queue WHERE id = ?", params![id])
    .map_err(|e| eyre!("Failed to remove queue item {}: {}", id, e))?;
  Ok(removed > 0)
}

/// Increment `retry_count`, deleting the row once it reaches `max_retries`.
/// `None` when the item is no longer queued.
pub(crate) fn charge_retry(conn: &Connection, id: &str) -> Result<Option<RetryCharge>> {
  let counts: Option<(u32, u32)> = conn
    .query_row(
      "UPDATE queue SET retry_count = retry_count + 1 WHERE id = ? RETURNING retry_count, max_retries",
      params![id],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(|e| eyre!("Failed to bump retry count for {}: {}", id, e))?;

  let Some((retry_count, max_retries)) = counts else {
    return Ok(None);
  };

  let still_eligible = retry_count < max_retries;
  if !still_eligible {
    delete(conn, id)?;
  }

  Ok(Some(RetryCharge {
    retry_count,
    max_retries,
    still_eligible,
  }))
}

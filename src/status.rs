//! Per-item sync status, kept apart from the queue so the UI can show progress
//! without reading queue internals.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::model::{QueueItem, ResourceType, ValidationError};
use crate::store::{conversion_error, from_millis, saturating_add, to_millis, Collection, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Pending,
  Syncing,
  Completed,
  Failed,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncState::Pending => "pending",
      SyncState::Syncing => "syncing",
      SyncState::Completed => "completed",
      SyncState::Failed => "failed",
    }
  }
}

impl fmt::Display for SyncState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncState {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(SyncState::Pending),
      "syncing" => Ok(SyncState::Syncing),
      "completed" => Ok(SyncState::Completed),
      "failed" => Ok(SyncState::Failed),
      other => Err(ValidationError::Unknown {
        kind: "sync state",
        value: other.to_string(),
      }),
    }
  }
}

/// Sync state of one logical item, keyed by queue id or URL key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusRecord {
  pub key: String,
  pub status: SyncState,
  pub resource_type: Option<ResourceType>,
  pub retry_count: u32,
  /// Time of the most recent transition
  pub last_attempt: DateTime<Utc>,
  /// Earliest time the processor may attempt the item again
  pub next_retry: Option<DateTime<Utc>>,
  /// Last failure message; only set when `status` is `Failed`
  pub error: Option<String>,
}

impl SyncStatusRecord {
  pub(crate) fn for_item(item: &QueueItem, status: SyncState, at: DateTime<Utc>) -> Self {
    Self {
      key: item.id.clone(),
      status,
      resource_type: Some(item.resource_type()),
      retry_count: item.retry_count,
      last_attempt: at,
      next_retry: None,
      error: None,
    }
  }
}

/// Exponential backoff with a ceiling: `min(base * 2^retry_count, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay: Duration::seconds(60),
      max_delay: Duration::minutes(16),
    }
  }
}

impl RetryPolicy {
  pub fn delay_for(&self, retry_count: u32) -> Duration {
    let base = self.base_delay.num_milliseconds().max(0);
    let max = self.max_delay.num_milliseconds().max(0);

    // 2^retry_count, saturating once the shift leaves the positive range
    let factor = 1_i64
      .checked_shl(retry_count)
      .filter(|f| *f > 0)
      .unwrap_or(i64::MAX);

    Duration::milliseconds(base.saturating_mul(factor).min(max))
  }

  pub fn next_retry_at(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    saturating_add(now, self.delay_for(retry_count))
  }
}

/// Counts of records in each state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
  pub total: u64,
  pub pending: u64,
  pub syncing: u64,
  pub completed: u64,
  pub failed: u64,
}

impl StateCounts {
  fn add(&mut self, status: SyncState, n: u64) {
    self.total += n;
    match status {
      SyncState::Pending => self.pending += n,
      SyncState::Syncing => self.syncing += n,
      SyncState::Completed => self.completed += n,
      SyncState::Failed => self.failed += n,
    }
  }
}

/// Sync progress summary for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
  #[serde(flatten)]
  pub overall: StateCounts,
  /// Items still waiting in the queue
  pub queued: u64,
  pub by_resource: BTreeMap<ResourceType, StateCounts>,
}

/// Stored for failures reported without a message.
const UNKNOWN_FAILURE: &str = "sync failed without an error message";

#[derive(Clone, Debug)]
pub struct SyncTracker {
  store: Store,
}

impl SyncTracker {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  /// Record a transition for `key`, stamping it with the current time.
  ///
  /// `error` is kept only for `Failed`, which always carries a message. Resource
  /// type and retry count of an existing record are preserved.
  pub async fn set_status(&self, key: &str, status: SyncState, error: Option<&str>) -> Result<()> {
    let error = match status {
      SyncState::Failed => Some(
        error
          .map(str::trim)
          .filter(|e| !e.is_empty())
          .unwrap_or(UNKNOWN_FAILURE)
          .to_string(),
      ),
      _ => None,
    };
    let now = Utc::now();

    self
      .store
      .call(move |conn| {
        conn
          .execute(
            "INSERT INTO sync_status (key, status, retry_count, last_attempt, next_retry, error)
             VALUES (?1, ?2, 0, ?3, NULL, ?4)
             ON CONFLICT(key) DO UPDATE SET
               status = excluded.status,
               last_attempt = excluded.last_attempt,
               next_retry = NULL,
               error = excluded.error",
            params![key, status.as_str(), to_millis(now), error],
          )
          .map_err(|e| eyre!("Failed to set status of {}: {}", key, e))?;
        Ok(())
      })
      .await
  }

  pub async fn get_status(&self, key: &str) -> Result<Option<SyncStatusRecord>> {
    self.store.call(|conn| get(conn, key)).await
  }

  /// Records waiting for delivery.
  pub async fn get_pending(&self) -> Result<Vec<SyncStatusRecord>> {
    self.by_status(SyncState::Pending).await
  }

  /// Records in `status`, most recent transition first.
  pub async fn by_status(&self, status: SyncState) -> Result<Vec<SyncStatusRecord>> {
    self
      .store
      .call(move |conn| {
        let mut stmt = conn
          .prepare(&format!(
            "{} WHERE status = ? ORDER BY last_attempt DESC, key",
            SELECT_RECORDS
          ))
          .map_err(|e| eyre!("Failed to prepare status query: {}", e))?;

        let records = stmt
          .query_map(params![status.as_str()], read_record)
          .map_err(|e| eyre!("Failed to query status: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read status record: {}", e))?;
        Ok(records)
      })
      .await
  }

  pub async fn clear(&self) -> Result<()> {
    self.store.clear(Collection::SyncStatus).await
  }

  pub async fn sync_stats(&self) -> Result<SyncStats> {
    self
      .store
      .call(|conn| {
        let mut stats = SyncStats::default();

        let mut stmt = conn
          .prepare("SELECT status, resource_type, COUNT(*) FROM sync_status GROUP BY status, resource_type")
          .map_err(|e| eyre!("Failed to prepare stats query: {}", e))?;
        let rows = stmt
          .query_map([], |row| {
            let status: String = row.get(0)?;
            let status = status.parse::<SyncState>().map_err(|e| conversion_error(0, e))?;
            let resource: Option<String> = row.get(1)?;
            let resource = resource
              .map(|r| r.parse::<ResourceType>())
              .transpose()
              .map_err(|e| conversion_error(1, e))?;
            Ok((status, resource, row.get::<_, u64>(2)?))
          })
          .map_err(|e| eyre!("Failed to query stats: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read stats row: {}", e))?;

        for (status, resource, n) in rows {
          stats.overall.add(status, n);
          if let Some(resource) = resource {
            stats.by_resource.entry(resource).or_default().add(status, n);
          }
        }

        stats.queued = conn
          .query_row("SELECT COUNT(*) FROM queue", [], |row| row.get(0))
          .map_err(|e| eyre!("Failed to count queue: {}", e))?;

        Ok(stats)
      })
      .await
  }
}

const SELECT_RECORDS: &str =
  "SELECT key, status, resource_type, retry_count, last_attempt, next_retry, error FROM sync_status";

fn read_record(row: &Row<'_>) -> rusqlite::Result<SyncStatusRecord> {
  let status: String = row.get(1)?;
  let resource_type: Option<String> = row.get(2)?;
  let next_retry: Option<i64> = row.get(5)?;

  Ok(SyncStatusRecord {
    key: row.get(0)?,
    status: status.parse().map_err(|e| conversion_error(1, e))?,
    resource_type: resource_type
      .map(|r| r.parse())
      .transpose()
      .map_err(|e| conversion_error(2, e))?,
    retry_count: row.get(3)?,
    last_attempt: from_millis(row.get(4)?),
    next_retry: next_retry.map(from_millis),
    error: row.get(6)?,
  })
}

pub(crate) fn get(conn: &Connection, key: &str) -> Result<Option<SyncStatusRecord>> {
  conn
    .query_row(
      &format!("{} WHERE key = ?", SELECT_RECORDS),
      params![key],
      read_record,
    )
    .optional()
    .map_err(|e| eyre!("Failed to read status of {}: {}", key, e))
}

/// Write a full record. `snapshot` keeps the dropped queue item of a terminal
/// failure so it can be re-enqueued on request.
pub(crate) fn upsert(
  conn: &Connection,
  record: &SyncStatusRecord,
  snapshot: Option<&QueueItem>,
) -> Result<()> {
  let snapshot = snapshot
    .map(serde_json::to_string)
    .transpose()
    .map_err(|e| eyre!("Failed to serialize snapshot of {}: {}", record.key, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO sync_status
         (key, status, resource_type, retry_count, last_attempt, next_retry, error, snapshot)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        record.key,
        record.status.as_str(),
        record.resource_type.map(|r| r.as_str()),
        record.retry_count,
        to_millis(record.last_attempt),
        record.next_retry.map(to_millis),
        record.error,
        snapshot,
      ],
    )
    .map_err(|e| eyre!("Failed to write status of {}: {}", record.key, e))?;

  Ok(())
}

/// Queue item captured when `key` failed terminally.
pub(crate) fn failed_snapshot(conn: &Connection, key: &str) -> Result<Option<QueueItem>> {
  let snapshot: Option<Option<String>> = conn
    .query_row(
      "SELECT snapshot FROM sync_status WHERE key = ? AND status = 'failed'",
      params![key],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read snapshot of {}: {}", key, e))?;

  snapshot
    .flatten()
    .map(|s| serde_json::from_str(&s))
    .transpose()
    .map_err(|e| eyre!("Failed to parse snapshot of {}: {}", key, e))
}

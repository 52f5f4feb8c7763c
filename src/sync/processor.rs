//! Drains the mutation queue against the network.
//!
//! The processor is the only component that sends queued mutations. Each pass
//! walks the queue in priority order and settles every item independently:
//! a delivery failure or a storage fault on one item is accounted for and
//! the pass moves on to the next.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::connectivity::Connectivity;
use super::transport::{OutboundRequest, Transport, TransportError, TransportResponse};
use crate::model::{QueueItem, ResourceType};
use crate::queue::{self, MutationQueue, UnreadableItem};
use crate::status::{self, RetryPolicy, SyncState, SyncStatusRecord};
use crate::store::Store;

/// Longest slice of a response body kept in a failure message.
const MAX_ERROR_BODY: usize = 200;

/// Outcome of one attempt, before it is accounted against the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
  Delivered { status: u16 },
  Failed { error: String, retryable: bool },
}

/// Whether a non-2xx status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
  matches!(status, 408 | 429) || (500..600).contains(&status)
}

impl AttemptResult {
  pub fn from_response(response: &TransportResponse) -> Self {
    if response.is_success() {
      return AttemptResult::Delivered {
        status: response.status,
      };
    }

    let body: String = response.body.trim().chars().take(MAX_ERROR_BODY).collect();
    let error = if body.is_empty() {
      format!("HTTP {}", response.status)
    } else {
      format!("HTTP {}: {}", response.status, body)
    };

    AttemptResult::Failed {
      error,
      retryable: is_retryable_status(response.status),
    }
  }

  pub fn from_transport_error(err: &TransportError) -> Self {
    AttemptResult::Failed {
      error: err.to_string(),
      retryable: !matches!(err, TransportError::InvalidRequest(_)),
    }
  }
}

/// What happened to one queued item during a pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
  /// Delivered and removed from the queue
  Completed,
  /// Failed transiently; stays queued until `next_retry`
  Retrying {
    retry_count: u32,
    next_retry: DateTime<Utc>,
  },
  /// Removed from the queue with a terminal `failed` status
  Failed { error: String },
  /// Backoff has not elapsed, or the pass stopped before reaching the item
  Deferred { next_retry: Option<DateTime<Utc>> },
  /// The item left the queue while it was in flight
  Discarded,
  /// A storage fault while accounting the item
  Errored { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
  pub id: String,
  pub resource_type: ResourceType,
  #[serde(flatten)]
  pub outcome: ItemOutcome,
}

/// Aggregate result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
  pub succeeded: usize,
  pub retried: usize,
  pub failed: usize,
  pub deferred: usize,
  pub discarded: usize,
  pub errored: usize,
  pub items: Vec<ItemReport>,
}

impl SyncReport {
  fn record(&mut self, id: &str, resource_type: ResourceType, outcome: ItemOutcome) {
    match &outcome {
      ItemOutcome::Completed => self.succeeded += 1,
      ItemOutcome::Retrying { .. } => self.retried += 1,
      ItemOutcome::Failed { .. } => self.failed += 1,
      ItemOutcome::Deferred { .. } => self.deferred += 1,
      ItemOutcome::Discarded => self.discarded += 1,
      ItemOutcome::Errored { .. } => self.errored += 1,
    }
    self.items.push(ItemReport {
      id: id.to_string(),
      resource_type,
      outcome,
    });
  }

  pub fn attempted(&self) -> usize {
    self.succeeded + self.retried + self.failed + self.discarded + self.errored
  }

  pub fn outcome(&self, id: &str) -> Option<&ItemOutcome> {
    self.items.iter().find(|i| i.id == id).map(|i| &i.outcome)
  }

  /// One-line summary for the user, e.g. "3 synced, 1 retrying, 1 failed".
  pub fn summary(&self) -> String {
    let mut parts = vec![
      format!("{} synced", self.succeeded),
      format!("{} retrying", self.retried),
      format!("{} failed", self.failed),
    ];
    if self.deferred > 0 {
      parts.push(format!("{} deferred", self.deferred));
    }
    if self.errored > 0 {
      parts.push(format!("{} errored", self.errored));
    }
    parts.join(", ")
  }
}

impl fmt::Display for SyncReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.summary())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DrainOutcome {
  /// Nothing was attempted because the network is reported offline
  Offline,
  Ran(SyncReport),
}

impl DrainOutcome {
  pub fn report(&self) -> Option<&SyncReport> {
    match self {
      DrainOutcome::Offline => None,
      DrainOutcome::Ran(report) => Some(report),
    }
  }
}

#[derive(Clone)]
pub struct SyncProcessor {
  store: Store,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  retry: RetryPolicy,
  request_timeout: Duration,
  /// Serializes passes so an item is never in flight twice
  drain_lock: Arc<Mutex<()>>,
}

impl SyncProcessor {
  pub fn new(
    queue: MutationQueue,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      store: queue.store().clone(),
      transport,
      connectivity,
      retry: RetryPolicy::default(),
      request_timeout: Duration::from_secs(30),
      drain_lock: Arc::new(Mutex::new(())),
    }
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.retry
  }

  /// Run one pass over the queue.
  ///
  /// Returns `Err` only when the queue cannot be read at all; per-item faults
  /// are reported in the [`SyncReport`].
  pub async fn drain(&self) -> Result<DrainOutcome> {
    if !self.connectivity.is_online() {
      warn!("Network offline, skipping sync");
      return Ok(DrainOutcome::Offline);
    }

    let _pass = self.drain_lock.lock().await;
    let entries = self.store.call(|conn| queue::scan(conn, true)).await?;
    let mut report = SyncReport::default();

    for entry in &entries {
      let item = match entry {
        Ok(item) => item,
        Err(bad) => {
          let outcome = self.retire(bad).await.unwrap_or_else(|e| {
            error!(id = %bad.id, error = %e, "Storage fault while retiring item");
            ItemOutcome::Errored {
              error: e.to_string(),
            }
          });
          let resource_type = bad.resource_type.unwrap_or(ResourceType::Generic);
          report.record(&bad.id, resource_type, outcome);
          continue;
        }
      };

      if !self.connectivity.is_online() {
        let deferred = ItemOutcome::Deferred { next_retry: None };
        report.record(&item.id, item.resource_type(), deferred);
        continue;
      }

      let outcome = match self.process(item).await {
        Ok(outcome) => outcome,
        Err(e) => {
          error!(id = %item.id, error = %e, "Storage fault while syncing item");
          ItemOutcome::Errored {
            error: e.to_string(),
          }
        }
      };
      report.record(&item.id, item.resource_type(), outcome);
    }

    if entries.is_empty() {
      debug!("Sync queue empty");
    } else {
      info!(
        succeeded = report.succeeded,
        retried = report.retried,
        failed = report.failed,
        deferred = report.deferred,
        errored = report.errored,
        "Sync pass finished: {}",
        report.summary()
      );
    }

    Ok(DrainOutcome::Ran(report))
  }

  /// Turn a row that no longer decodes into a terminal failure so the rest
  /// of the queue keeps moving.
  async fn retire(&self, bad: &UnreadableItem) -> Result<ItemOutcome> {
    let now = Utc::now();
    let error = format!("Unreadable queue item: {}", bad.error);

    let outcome = self
      .store
      .transaction(|tx| {
        if !queue::delete(tx, &bad.id)? {
          return Ok(ItemOutcome::Discarded);
        }
        let record = SyncStatusRecord {
          key: bad.id.clone(),
          status: SyncState::Failed,
          resource_type: bad.resource_type,
          retry_count: 0,
          last_attempt: now,
          next_retry: None,
          error: Some(error.clone()),
        };
        status::upsert(tx, &record, None)?;
        Ok(ItemOutcome::Failed {
          error: error.clone(),
        })
      })
      .await?;

    warn!(id = %bad.id, error = %bad.error, "Retired unreadable queue item");
    Ok(outcome)
  }

  async fn process(&self, item: &QueueItem) -> Result<ItemOutcome> {
    let now = Utc::now();

    let last = self.store.call(|conn| status::get(conn, &item.id)).await?;
    if let Some(next_retry) = last.and_then(|r| r.next_retry) {
      if next_retry > now {
        debug!(id = %item.id, %next_retry, "Backoff not elapsed");
        return Ok(ItemOutcome::Deferred {
          next_retry: Some(next_retry),
        });
      }
    }

    let claimed = self
      .store
      .transaction(|tx| {
        if !queue::exists(tx, &item.id)? {
          return Ok(false);
        }
        status::upsert(tx, &SyncStatusRecord::for_item(item, SyncState::Syncing, now), None)?;
        Ok(true)
      })
      .await?;
    if !claimed {
      return Ok(ItemOutcome::Discarded);
    }

    let attempt = self.attempt(item).await;
    debug!(id = %item.id, ?attempt, "Attempt finished");
    self.settle(item, attempt).await
  }

  async fn attempt(&self, item: &QueueItem) -> AttemptResult {
    let request = OutboundRequest::from_operation(&item.operation);
    match tokio::time::timeout(self.request_timeout, self.transport.send(request)).await {
      Ok(Ok(response)) => AttemptResult::from_response(&response),
      Ok(Err(err)) => AttemptResult::from_transport_error(&err),
      Err(_) => AttemptResult::from_transport_error(&TransportError::Timeout(self.request_timeout)),
    }
  }

  async fn settle(&self, item: &QueueItem, attempt: AttemptResult) -> Result<ItemOutcome> {
    let now = Utc::now();

    match attempt {
      AttemptResult::Delivered { .. } => {
        self
          .store
          .transaction(|tx| {
            if !queue::delete(tx, &item.id)? {
              return Ok(ItemOutcome::Discarded);
            }
            let record = SyncStatusRecord::for_item(item, SyncState::Completed, now);
            status::upsert(tx, &record, None)?;
            Ok(ItemOutcome::Completed)
          })
          .await
      }

      AttemptResult::Failed {
        error,
        retryable: true,
      } => {
        let retry = self.retry;
        let outcome = self
          .store
          .transaction(|tx| {
            let Some(charge) = queue::charge_retry(tx, &item.id)? else {
              return Ok(ItemOutcome::Discarded);
            };

            let mut record = SyncStatusRecord::for_item(item, SyncState::Pending, now);
            record.retry_count = charge.retry_count;

            if charge.still_eligible {
              // Backoff grows from the count before this failure, so the
              // first retry waits the base delay
              let next_retry = retry.next_retry_at(item.retry_count, now);
              record.next_retry = Some(next_retry);
              status::upsert(tx, &record, None)?;
              return Ok(ItemOutcome::Retrying {
                retry_count: charge.retry_count,
                next_retry,
              });
            }

            record.status = SyncState::Failed;
            record.error = Some(error.clone());
            let mut snapshot = item.clone();
            snapshot.retry_count = charge.retry_count;
            status::upsert(tx, &record, Some(&snapshot))?;
            Ok(ItemOutcome::Failed {
              error: error.clone(),
            })
          })
          .await?;

        match &outcome {
          ItemOutcome::Retrying {
            retry_count,
            next_retry,
          } => {
            warn!(id = %item.id, retry_count, %next_retry, %error, "Sync failed, will retry")
          }
          ItemOutcome::Failed { .. } => {
            warn!(id = %item.id, max_retries = item.max_retries, %error, "Retries exhausted")
          }
          _ => {}
        }
        Ok(outcome)
      }

      AttemptResult::Failed {
        error,
        retryable: false,
      } => {
        let outcome = self
          .store
          .transaction(|tx| {
            if !queue::delete(tx, &item.id)? {
              return Ok(ItemOutcome::Discarded);
            }
            let mut record = SyncStatusRecord::for_item(item, SyncState::Failed, now);
            record.error = Some(error.clone());
            status::upsert(tx, &record, Some(item))?;
            Ok(ItemOutcome::Failed {
              error: error.clone(),
            })
          })
          .await?;

        if matches!(outcome, ItemOutcome::Failed { .. }) {
          warn!(id = %item.id, %error, "Sync rejected, not retrying");
        }
        Ok(outcome)
      }
    }
  }
}

impl fmt::Debug for SyncProcessor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SyncProcessor")
      .field("store", &self.store)
      .field("retry", &self.retry)
      .field("request_timeout", &self.request_timeout)
      .finish_non_exhaustive()
  }
}

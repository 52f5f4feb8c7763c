//! Composition root: every component built around one injected store handle.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::ApiClient;
use crate::cache::{CacheLayer, SqliteStorage};
use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::model::{EnqueueOptions, Operation, ResourceType};
use crate::queue::{self, MutationQueue, QueueDefaults};
use crate::status::{self, RetryPolicy, SyncState, SyncStats, SyncStatusRecord, SyncTracker};
use crate::store::{AssetStore, StorageStats, Store, UserData};
use crate::sync::{
  BackgroundSync, ChannelBackgroundSync, Connectivity, DrainOutcome, HttpTransport, ItemOutcome,
  SyncProcessor, Transport,
};

/// Tunables of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
  pub queue: QueueDefaults,
  pub retry: RetryPolicy,
  pub request_timeout: Duration,
  pub cache_ttl: chrono::Duration,
  pub cache_schema_version: u32,
  pub sweep_interval: Duration,
  /// Drain right after a successful enqueue while online
  pub drain_on_enqueue: bool,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self::from_config(&Config::default())
  }
}

impl EngineSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      queue: config.queue,
      retry: config.retry.policy(),
      request_timeout: config.request_timeout(),
      cache_ttl: config.cache.default_ttl(),
      cache_schema_version: config.cache.schema_version,
      sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
      drain_on_enqueue: true,
    }
  }
}

/// The offline sync engine.
///
/// Cloning is cheap and every clone shares the same store, connectivity flag
/// and drain lock.
#[derive(Clone)]
pub struct Engine {
  store: Store,
  queue: MutationQueue,
  cache: CacheLayer<SqliteStorage>,
  tracker: SyncTracker,
  capabilities: CapabilityRegistry,
  processor: SyncProcessor,
  api: ApiClient,
  background: Arc<dyn BackgroundSync>,
  connectivity: Connectivity,
  settings: EngineSettings,
}

impl Engine {
  pub fn new(
    store: Store,
    transport: Arc<dyn Transport>,
    background: Arc<dyn BackgroundSync>,
    connectivity: Connectivity,
    settings: EngineSettings,
  ) -> Self {
    let queue = MutationQueue::new(store.clone()).with_defaults(settings.queue);
    let cache = CacheLayer::new(SqliteStorage::new(store.clone()))
      .with_default_ttl(settings.cache_ttl)
      .with_schema_version(settings.cache_schema_version);
    let tracker = SyncTracker::new(store.clone());
    let processor = SyncProcessor::new(queue.clone(), transport.clone(), connectivity.clone())
      .with_retry_policy(settings.retry)
      .with_request_timeout(settings.request_timeout);
    let api = ApiClient::new(
      transport,
      cache.clone(),
      tracker.clone(),
      connectivity.clone(),
    );

    Self {
      capabilities: CapabilityRegistry::new(store.clone()),
      store,
      queue,
      cache,
      tracker,
      processor,
      api,
      background,
      connectivity,
      settings,
    }
  }

  /// Production wiring from configuration: the configured store, an HTTP
  /// transport, and background sync tags delivered on the returned receiver.
  pub fn open(
    config: &Config,
    connectivity: Connectivity,
  ) -> Result<(Self, mpsc::UnboundedReceiver<String>)> {
    let store = config.store()?;
    let transport = HttpTransport::new(
      config.api.base_url.as_deref(),
      Config::get_api_token(),
      config.request_timeout(),
    )?;
    let (background, tags) = ChannelBackgroundSync::new();

    let engine = Self::new(
      store,
      Arc::new(transport),
      Arc::new(background),
      connectivity,
      EngineSettings::from_config(config),
    );
    Ok((engine, tags))
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Validate and persist a mutation, returning its id.
  ///
  /// The item and its `pending` status are written in one transaction. Cached
  /// reads of the resource family are invalidated, background sync is
  /// requested, and when online a drain is started on a separate task, so the
  /// call returns without waiting on the network. Only validation and storage
  /// faults are errors; delivery problems show up in the sync status.
  pub async fn enqueue(&self, operation: Operation, options: EnqueueOptions) -> Result<String> {
    let item = self.queue.prepare(operation, options)?;
    let resource_type = item.resource_type();

    self
      .store
      .transaction(|tx| {
        queue::insert(tx, &item)?;
        let record = SyncStatusRecord::for_item(&item, SyncState::Pending, item.created_at);
        status::upsert(tx, &record, None)
      })
      .await?;
    info!(id = %item.id, %resource_type, priority = %item.priority, "Enqueued mutation");

    let pattern = format!("{}:", resource_type.cache_namespace());
    if let Err(e) = self.cache.invalidate(Some(&pattern)).await {
      warn!(%pattern, error = %e, "Failed to invalidate cached reads");
    }

    self.after_enqueue(resource_type).await;
    Ok(item.id)
  }

  /// Put a terminally failed item back in the queue with a fresh retry budget.
  ///
  /// Returns `None` when `key` has no failed record to revive.
  pub async fn requeue_failed(&self, key: &str) -> Result<Option<String>> {
    let now = Utc::now();
    let revived = self
      .store
      .transaction(|tx| {
        let Some(mut item) = status::failed_snapshot(tx, key)? else {
          return Ok(None);
        };
        if queue::exists(tx, &item.id)? {
          return Err(eyre!("Item {} is already queued", item.id));
        }

        item.retry_count = 0;
        queue::insert(tx, &item)?;
        status::upsert(tx, &SyncStatusRecord::for_item(&item, SyncState::Pending, now), None)?;
        Ok(Some(item))
      })
      .await?;

    let Some(item) = revived else {
      return Ok(None);
    };
    info!(id = %item.id, "Requeued failed mutation");

    self.after_enqueue(item.resource_type()).await;
    Ok(Some(item.id))
  }

  async fn after_enqueue(&self, resource_type: ResourceType) {
    let tag = resource_type.sync_tag();
    if let Err(e) = self.background.register(&tag).await {
      warn!(%tag, error = %e, "Background sync registration failed");
    }

    if self.settings.drain_on_enqueue && self.connectivity.is_online() {
      let engine = self.clone();
      tokio::spawn(async move {
        engine.drain_logged().await;
      });
    }
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  pub async fn drain(&self) -> Result<DrainOutcome> {
    self.processor.drain().await
  }

  /// Drain, logging instead of returning errors. Returns the earliest time a
  /// deferred item becomes due.
  async fn drain_logged(&self) -> Option<DateTime<Utc>> {
    match self.drain().await {
      Ok(DrainOutcome::Ran(report)) => report
        .items
        .iter()
        .filter_map(|i| match &i.outcome {
          ItemOutcome::Retrying { next_retry, .. } => Some(*next_retry),
          ItemOutcome::Deferred { next_retry } => *next_retry,
          _ => None,
        })
        .min(),
      Ok(DrainOutcome::Offline) => None,
      Err(e) => {
        error!(error = %e, "Sync pass failed");
        None
      }
    }
  }

  /// Sweep expired cache entries.
  pub async fn sweep_cache(&self) -> Result<u64> {
    let removed = self.cache.clear_expired().await?;
    if removed > 0 {
      info!(removed, "Swept expired cache entries");
    }
    Ok(removed)
  }

  /// Erase every collection. A pass in flight settles its current item
  /// against the emptied store and leaves nothing behind.
  pub async fn clear_all(&self) -> Result<()> {
    self.store.clear_all().await?;
    info!("Cleared all offline data");
    Ok(())
  }

  /// Long-running delivery loop for the hosting environment.
  ///
  /// Drains on start, on every offline to online transition, on every
  /// background sync tag and when the earliest backoff elapses. Expired
  /// cache entries are swept on the configured interval. Returns once
  /// `shutdown` completes.
  pub async fn run(
    &self,
    mut tags: mpsc::UnboundedReceiver<String>,
    shutdown: impl Future<Output = ()>,
  ) -> Result<()> {
    tokio::pin!(shutdown);

    let mut online = self.connectivity.subscribe();
    let mut sweep = tokio::time::interval(self.settings.sweep_interval.max(Duration::from_secs(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tags_open = true;

    let mut next_due = self.drain_logged().await;

    loop {
      let wake = next_due.map(instant_at);

      tokio::select! {
        _ = &mut shutdown => {
          info!("Sync loop shutting down");
          return Ok(());
        }
        changed = online.changed() => {
          if changed.is_err() {
            return Ok(());
          }
          if *online.borrow_and_update() {
            next_due = self.drain_logged().await;
          }
        }
        tag = tags.recv(), if tags_open => match tag {
          Some(tag) => {
            debug!(%tag, "Background sync requested");
            next_due = self.drain_logged().await;
          }
          None => tags_open = false,
        },
        _ = sleep_until_opt(wake), if wake.is_some() => {
          next_due = self.drain_logged().await;
        }
        _ = sweep.tick() => {
          if let Err(e) = self.sweep_cache().await {
            error!(error = %e, "Cache sweep failed");
          }
        }
      }
    }
  }

  // ==========================================================================
  // Statistics and accessors
  // ==========================================================================

  pub async fn sync_stats(&self) -> Result<SyncStats> {
    self.tracker.sync_stats().await
  }

  pub async fn storage_stats(&self) -> Result<StorageStats> {
    self.store.storage_stats().await
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn cache(&self) -> &CacheLayer<SqliteStorage> {
    &self.cache
  }

  pub fn tracker(&self) -> &SyncTracker {
    &self.tracker
  }

  pub fn capabilities(&self) -> &CapabilityRegistry {
    &self.capabilities
  }

  pub fn api(&self) -> &ApiClient {
    &self.api
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn user_data(&self) -> UserData {
    UserData::new(self.store.clone())
  }

  pub fn assets(&self) -> AssetStore {
    AssetStore::new(self.store.clone())
  }

  pub fn settings(&self) -> &EngineSettings {
    &self.settings
  }
}

/// Longest single sleep of the run loop; far-off retries are re-checked daily.
const MAX_WAKE: Duration = Duration::from_secs(24 * 60 * 60);

fn instant_at(at: DateTime<Utc>) -> Instant {
  let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
  Instant::now() + wait.min(MAX_WAKE)
}

async fn sleep_until_opt(at: Option<Instant>) {
  match at {
    Some(at) => tokio::time::sleep_until(at).await,
    None => std::future::pending::<()>().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{HarvestPayload, Mutation};
  use crate::sync::{NoopBackgroundSync, OutboundRequest, TransportError, TransportResponse};
  use futures::future::BoxFuture;
  use serde_json::json;

  struct AcceptAll;

  impl Transport for AcceptAll {
    fn send(
      &self,
      _request: OutboundRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
      Box::pin(async {
        Ok(TransportResponse {
          status: 201,
          body: String::new(),
        })
      })
    }
  }

  /// Never answers.
  struct Stalled;

  impl Transport for Stalled {
    fn send(
      &self,
      _request: OutboundRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
      Box::pin(futures::future::pending())
    }
  }

  fn harvest_op() -> Operation {
    Operation::post(
      "/api/harvests",
      Mutation::Harvest(HarvestPayload {
        farm_id: "farm-2".to_string(),
        crop: "sorghum".to_string(),
        quantity_kg: 300.0,
        harvested_at: None,
        grade: None,
        photo_keys: Vec::new(),
      }),
    )
  }

  fn engine(online: bool, background: Arc<dyn BackgroundSync>) -> Engine {
    Engine::new(
      Store::in_memory(),
      Arc::new(AcceptAll),
      background,
      Connectivity::new(online),
      EngineSettings::default(),
    )
  }

  #[tokio::test]
  async fn test_offline_enqueue_leaves_pending_status() {
    let engine = engine(false, Arc::new(NoopBackgroundSync));

    let id = engine
      .enqueue(harvest_op(), EnqueueOptions::default())
      .await
      .unwrap();

    let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, SyncState::Pending);
    assert_eq!(record.resource_type, Some(ResourceType::Harvest));
    assert_eq!(engine.queue().len().await.unwrap(), 1);
    assert_eq!(engine.sync_stats().await.unwrap().queued, 1);
  }

  #[tokio::test]
  async fn test_online_enqueue_drains_immediately() {
    let engine = engine(true, Arc::new(NoopBackgroundSync));

    let id = engine
      .enqueue(harvest_op(), EnqueueOptions::default())
      .await
      .unwrap();

    for _ in 0..100 {
      if engine.queue().is_empty().await.unwrap() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, SyncState::Completed);
    assert!(engine.queue().is_empty().await.unwrap());
  }

  #[tokio::test]
  async fn test_online_enqueue_does_not_wait_for_delivery() {
    let engine = Engine::new(
      Store::in_memory(),
      Arc::new(Stalled),
      Arc::new(NoopBackgroundSync),
      Connectivity::new(true),
      EngineSettings::default(),
    );

    let id = tokio::time::timeout(
      Duration::from_secs(1),
      engine.enqueue(harvest_op(), EnqueueOptions::default()),
    )
    .await
    .expect("enqueue waited on the transport")
    .unwrap();

    assert!(engine.tracker().get_status(&id).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_enqueue_invalidates_cached_reads_and_registers_tag() {
    let (background, mut tags) = ChannelBackgroundSync::new();
    let engine = engine(false, Arc::new(background));
    engine
      .cache()
      .set("harvests:/api/harvests", &json!([]), chrono::Duration::minutes(5))
      .await
      .unwrap();
    engine
      .cache()
      .set("orders:/api/orders", &json!([]), chrono::Duration::minutes(5))
      .await
      .unwrap();

    engine
      .enqueue(harvest_op(), EnqueueOptions::default())
      .await
      .unwrap();

    let keys: Vec<String> = engine
      .cache()
      .entries()
      .await
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    assert_eq!(keys, vec!["orders:/api/orders".to_string()]);
    assert_eq!(tags.recv().await.as_deref(), Some("sync-harvest"));
  }

  #[tokio::test]
  async fn test_failed_registration_does_not_fail_enqueue() {
    let (background, tags) = ChannelBackgroundSync::new();
    drop(tags);
    let engine = engine(false, Arc::new(background));

    assert!(engine
      .enqueue(harvest_op(), EnqueueOptions::default())
      .await
      .is_ok());
  }

  #[tokio::test]
  async fn test_invalid_operation_writes_nothing() {
    let engine = engine(false, Arc::new(NoopBackgroundSync));
    let mut op = harvest_op();
    op.endpoint = String::new();

    assert!(engine.enqueue(op, EnqueueOptions::default()).await.is_err());
    assert_eq!(engine.storage_stats().await.unwrap().total_items(), 0);
  }

  #[tokio::test]
  async fn test_requeue_without_failure_is_none() {
    let engine = engine(false, Arc::new(NoopBackgroundSync));
    let id = engine
      .enqueue(harvest_op(), EnqueueOptions::default())
      .await
      .unwrap();

    assert_eq!(engine.requeue_failed(&id).await.unwrap(), None);
    assert_eq!(engine.requeue_failed("unknown").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_run_drains_on_reconnect_and_stops_on_shutdown() {
    let engine = engine(false, Arc::new(NoopBackgroundSync));
    let (_tx, tags) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let id = engine
      .enqueue(harvest_op(), EnqueueOptions::default())
      .await
      .unwrap();

    let runner = engine.clone();
    let handle = tokio::spawn(async move {
      runner
        .run(tags, async {
          let _ = stop_rx.await;
        })
        .await
    });

    engine.connectivity().set_online(true);
    for _ in 0..100 {
      if engine.queue().is_empty().await.unwrap() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(engine.queue().is_empty().await.unwrap());
    let record = engine.tracker().get_status(&id).await.unwrap().unwrap();
    assert_eq!(record.status, SyncState::Completed);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
  }
}

//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult};
use crate::store::saturating_add;

/// Cache layer that manages freshness, versioning and network fetching.
///
/// Entries carry two independent invalidation axes: a TTL for naturally stale
/// data and a schema version for breaking changes to the cached shape. A read
/// never returns an entry that fails either check; it evicts it and reports a
/// miss instead.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// TTL used by `fetch` when the caller passes none
  default_ttl: Duration,
  /// Version written by `set` and required by `get`
  schema_version: u32,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      default_ttl: Duration::minutes(30),
      schema_version: 1,
    }
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn with_schema_version(mut self, version: u32) -> Self {
    self.schema_version = version;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  pub fn schema_version(&self) -> u32 {
    self.schema_version
  }

  /// Overwrite `key` with `data`, fresh for `ttl`, at the layer's version.
  pub async fn set<T: Serialize>(&self, key: &str, data: &T, ttl: Duration) -> Result<()> {
    self.set_versioned(key, data, ttl, self.schema_version).await
  }

  pub async fn set_versioned<T: Serialize>(
    &self,
    key: &str,
    data: &T,
    ttl: Duration,
    version: u32,
  ) -> Result<()> {
    let data =
      serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    let now = Utc::now();

    self
      .storage
      .put(CacheEntry {
        key: key.to_string(),
        data,
        timestamp: now,
        expires_at: saturating_add(now, ttl),
        schema_version: version,
      })
      .await
  }

  /// Fresh data for `key`, or `None` when the caller must refetch.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    self.get_versioned(key, self.schema_version).await
  }

  /// Like `get`, requiring the entry to be written at `min_version` or later.
  pub async fn get_versioned<T: DeserializeOwned>(
    &self,
    key: &str,
    min_version: u32,
  ) -> Result<Option<T>> {
    Ok(self.lookup(key, min_version).await?.map(|(data, _)| data))
  }

  async fn lookup<T: DeserializeOwned>(
    &self,
    key: &str,
    min_version: u32,
  ) -> Result<Option<(T, chrono::DateTime<Utc>)>> {
    let Some(entry) = self.storage.entry(key).await? else {
      return Ok(None);
    };

    if !entry.is_usable(Utc::now(), min_version) {
      debug!(key, version = entry.schema_version, min_version, "Evicting stale cache entry");
      self.storage.remove(key).await?;
      return Ok(None);
    }

    match serde_json::from_value(entry.data) {
      Ok(data) => Ok(Some((data, entry.timestamp))),
      Err(e) => {
        debug!(key, error = %e, "Evicting cache entry of unexpected shape");
        self.storage.remove(key).await?;
        Ok(None)
      }
    }
  }

  /// Evict every entry whose key contains `pattern`, or the whole cache.
  pub async fn invalidate(&self, pattern: Option<&str>) -> Result<u64> {
    let removed = self.storage.remove_matching(pattern).await?;
    debug!(pattern, removed, "Invalidated cache entries");
    Ok(removed)
  }

  /// Sweep every expired entry.
  pub async fn clear_expired(&self) -> Result<u64> {
    self.storage.remove_expired(Utc::now()).await
  }

  /// Every stored entry, for inspection.
  pub async fn entries(&self) -> Result<Vec<CacheEntry>> {
    self.storage.entries().await
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh and current, return immediately
  /// 2. Otherwise fetch from network
  /// 3. Store the fetched data for `ttl` (or the default TTL)
  ///
  /// A fetch failure is returned to the caller; expired data is never served
  /// in its place.
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &str,
    ttl: Option<Duration>,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some((data, cached_at)) = self.lookup(key, self.schema_version).await? {
      return Ok(CacheResult::from_cache(data, cached_at));
    }

    let data = fetcher().await?;
    self
      .set(key, &data, ttl.unwrap_or(self.default_ttl))
      .await?;
    Ok(CacheResult::from_network(data))
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      default_ttl: self.default_ttl,
      schema_version: self.schema_version,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, NoopStorage, SqliteStorage};
  use crate::store::Store;
  use serde::Deserialize;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Price {
    crop: String,
    per_kg: f64,
  }

  fn layer() -> CacheLayer<SqliteStorage> {
    CacheLayer::new(SqliteStorage::new(Store::in_memory()))
  }

  fn maize() -> Price {
    Price {
      crop: "maize".to_string(),
      per_kg: 42.5,
    }
  }

  #[tokio::test]
  async fn test_set_then_get_before_ttl() {
    let cache = layer();

    cache
      .set("prices:/api/prices", &maize(), Duration::minutes(10))
      .await
      .unwrap();

    assert_eq!(cache.get::<Price>("prices:/api/prices").await.unwrap(), Some(maize()));
  }

  #[tokio::test]
  async fn test_extreme_ttls_are_clamped() {
    let cache = layer();

    cache.set("prices:forever", &maize(), Duration::MAX).await.unwrap();
    cache.set("prices:never", &maize(), Duration::MIN).await.unwrap();

    assert_eq!(cache.get::<Price>("prices:forever").await.unwrap(), Some(maize()));
    assert_eq!(cache.get::<Price>("prices:never").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_expired_entry_is_evicted_on_read() {
    let cache = layer();

    cache
      .set("prices:/api/prices", &maize(), Duration::milliseconds(20))
      .await
      .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(40)).await;

    assert_eq!(cache.get::<Price>("prices:/api/prices").await.unwrap(), None);
    assert!(cache.entries().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_older_version_reads_as_absent() {
    let cache = layer();

    cache
      .set_versioned("products:/api/products", &json!([1, 2]), Duration::minutes(10), 2)
      .await
      .unwrap();

    assert_eq!(
      cache
        .get_versioned::<Value>("products:/api/products", 2)
        .await
        .unwrap(),
      Some(json!([1, 2]))
    );
    assert_eq!(
      cache
        .get_versioned::<Value>("products:/api/products", 3)
        .await
        .unwrap(),
      None
    );
    assert!(cache.entries().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_layer_version_applies_to_plain_get() {
    let store = Store::in_memory();
    let old = CacheLayer::new(SqliteStorage::new(store.clone()));
    let new = CacheLayer::new(SqliteStorage::new(store)).with_schema_version(2);

    old
      .set("prices:/api/prices", &maize(), Duration::minutes(10))
      .await
      .unwrap();

    assert_eq!(new.get::<Price>("prices:/api/prices").await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_mismatched_shape_is_a_miss() {
    let cache = layer();

    cache
      .set("prices:/api/prices", &json!("not a price"), Duration::minutes(10))
      .await
      .unwrap();

    assert_eq!(cache.get::<Price>("prices:/api/prices").await.unwrap(), None);
    assert!(cache.entries().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_invalidate_by_pattern() {
    let cache = layer();
    for key in ["harvests:/api/harvests", "harvests:/api/harvests?farm=1", "orders:/api/orders"] {
      cache.set(key, &json!(key), Duration::minutes(10)).await.unwrap();
    }

    assert_eq!(cache.invalidate(Some("harvests:")).await.unwrap(), 2);
    let keys: Vec<String> = cache
      .entries()
      .await
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    assert_eq!(keys, vec!["orders:/api/orders".to_string()]);

    assert_eq!(cache.invalidate(None).await.unwrap(), 1);
    assert!(cache.entries().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_clear_expired_keeps_fresh_entries() {
    let cache = layer();
    cache
      .set("prices:/old", &maize(), Duration::zero())
      .await
      .unwrap();
    cache
      .set("prices:/new", &maize(), Duration::minutes(10))
      .await
      .unwrap();

    assert_eq!(cache.clear_expired().await.unwrap(), 1);
    assert_eq!(cache.entries().await.unwrap().len(), 1);
    assert_eq!(cache.clear_expired().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_fetch_uses_cache_after_first_call() {
    let cache = layer();
    let calls = AtomicUsize::new(0);

    for expected in [CacheSource::Network, CacheSource::Cache] {
      let result = cache
        .fetch("prices:/api/prices", None, || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(maize())
        })
        .await
        .unwrap();
      assert_eq!(result.source, expected);
      assert_eq!(result.data, maize());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fetch_failure_is_not_masked() {
    let cache = layer();
    cache
      .set("prices:/api/prices", &maize(), Duration::zero())
      .await
      .unwrap();

    let result = cache
      .fetch::<Price, _, _>("prices:/api/prices", None, || async { Err(eyre!("offline")) })
      .await;

    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_noop_layer_always_fetches() {
    let cache = CacheLayer::new(NoopStorage);
    let calls = AtomicUsize::new(0);

    for _ in 0..2 {
      let result = cache
        .fetch("k", None, || async {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(1_u32)
        })
        .await
        .unwrap();
      assert_eq!(result.source, CacheSource::Network);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}

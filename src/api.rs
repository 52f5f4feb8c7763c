//! Read client that goes through the cache layer.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheKey, CacheLayer, CacheResult, SqliteStorage};
use crate::status::{SyncState, SyncTracker};
use crate::sync::{Connectivity, OutboundRequest, Transport};

/// API reads with transparent caching.
///
/// A fresh cache entry is served without touching the network. On a miss the
/// read is fetched, its sync status recorded under the cache key, and the
/// result cached. Offline misses fail instead of returning stale data.
#[derive(Clone)]
pub struct ApiClient {
  transport: Arc<dyn Transport>,
  cache: CacheLayer<SqliteStorage>,
  tracker: SyncTracker,
  connectivity: Connectivity,
}

impl ApiClient {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: CacheLayer<SqliteStorage>,
    tracker: SyncTracker,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      transport,
      cache,
      tracker,
      connectivity,
    }
  }

  /// Read `key` as raw JSON, caching it for `ttl` (or the default TTL).
  pub async fn get_json(&self, key: &CacheKey, ttl: Option<Duration>) -> Result<CacheResult<Value>> {
    self.get(key, ttl).await
  }

  /// Read `key` and decode it as `T`.
  pub async fn get<T>(&self, key: &CacheKey, ttl: Option<Duration>) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
  {
    let cache_key = key.to_string();

    self
      .cache
      .fetch(&cache_key, ttl, || async {
        if !self.connectivity.is_online() {
          return Err(eyre!("Offline and {} is not cached", cache_key));
        }

        self
          .tracker
          .set_status(&cache_key, SyncState::Syncing, None)
          .await?;

        match self.fetch_remote(key).await {
          Ok(data) => {
            self
              .tracker
              .set_status(&cache_key, SyncState::Completed, None)
              .await?;
            debug!(key = %cache_key, "Fetched from network");
            Ok(data)
          }
          Err(e) => {
            let message = e.to_string();
            self
              .tracker
              .set_status(&cache_key, SyncState::Failed, Some(&message))
              .await?;
            Err(e)
          }
        }
      })
      .await
  }

  async fn fetch_remote<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<T> {
    let path = key.request_path();
    let response = self
      .transport
      .send(OutboundRequest::get(path.as_str()))
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", path, e))?;

    if !response.is_success() {
      return Err(eyre!("Failed to fetch {}: HTTP {}", path, response.status));
    }

    let body = response.json()?;
    serde_json::from_value(body).map_err(|e| eyre!("Failed to decode {}: {}", path, e))
  }

  /// Evict every cached read of one namespace.
  pub async fn invalidate_namespace(&self, namespace: &str) -> Result<u64> {
    self.cache.invalidate(Some(&format!("{}:", namespace))).await
  }
}

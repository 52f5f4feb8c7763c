//! Core types for the read cache.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One cached read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  pub key: String,
  pub data: Value,
  /// Write time
  pub timestamp: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub schema_version: u32,
}

impl CacheEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }

  /// Whether the entry may be served to a reader expecting `min_version`.
  pub fn is_usable(&self, now: DateTime<Utc>, min_version: u32) -> bool {
    !self.is_expired(now) && self.schema_version >= min_version
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Source of the data in a `CacheResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Freshly fetched
  Network,
  /// Fresh entry from the local cache
  Cache,
}

/// Logical identity of a cached read: `{namespace}:{endpoint}?{params}`.
///
/// Parameters are sorted so the same query always maps to the same key, and
/// every key of a resource family shares the `{namespace}:` prefix used for
/// invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  namespace: String,
  endpoint: String,
  params: BTreeMap<String, String>,
}

impl CacheKey {
  pub fn new(namespace: impl Into<String>, endpoint: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      endpoint: endpoint.into(),
      params: BTreeMap::new(),
    }
  }

  pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.params.insert(name.into(), value.to_string());
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  /// Pattern matching every key in this key's namespace.
  pub fn namespace_pattern(&self) -> String {
    format!("{}:", self.namespace)
  }

  /// Endpoint with its query string, as a transport would request it.
  pub fn request_path(&self) -> String {
    if self.params.is_empty() {
      return self.endpoint.clone();
    }
    format!("{}?{}", self.endpoint, self.query())
  }

  fn query(&self) -> String {
    url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(&self.params)
      .finish()
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.namespace, self.request_path())
  }
}

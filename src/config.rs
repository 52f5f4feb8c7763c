use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::queue::QueueDefaults;
use crate::status::RetryPolicy;
use crate::store::Store;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub storage: StorageConfig,
  pub queue: QueueDefaults,
  pub retry: RetryConfig,
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL that relative operation endpoints are joined onto
  pub base_url: Option<String>,
  /// Upper bound for one request, in seconds
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Store file (defaults to $XDG_DATA_HOME/agrosync/store.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub base_delay_secs: u64,
  pub max_delay_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay_secs: 60,
      max_delay_secs: 16 * 60,
    }
  }
}

impl RetryConfig {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      base_delay: seconds(self.base_delay_secs),
      max_delay: seconds(self.max_delay_secs),
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub default_ttl_minutes: u64,
  /// Version written to and required from cache entries
  pub schema_version: u32,
  /// Interval between sweeps of expired entries while running
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_minutes: 30,
      schema_version: 1,
      sweep_interval_secs: 15 * 60,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> chrono::Duration {
    seconds(self.default_ttl_minutes.saturating_mul(60))
  }
}

/// Capped at `u32::MAX` seconds so `now + duration` cannot overflow.
fn seconds(secs: u64) -> chrono::Duration {
  chrono::Duration::seconds(secs.min(u64::from(u32::MAX)) as i64)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./agrosync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/agrosync/config.yaml
  ///
  /// Without a file the defaults apply.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("agrosync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("agrosync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty document deserializes as null rather than an empty map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Store handle for the configured location.
  pub fn store(&self) -> Result<Store> {
    match &self.storage.path {
      Some(path) => Ok(Store::at(path)),
      None => Store::open_default(),
    }
  }

  pub fn request_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.api.timeout_secs)
  }

  /// Get the API token from the environment, if set.
  ///
  /// Checks AGROSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("AGROSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_file() {
    let config = Config::parse("").unwrap();

    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.queue.default_max_retries, 3);
    assert_eq!(config.queue.payment_max_retries, 5);
    assert_eq!(config.retry.policy(), RetryPolicy::default());
    assert_eq!(config.cache.default_ttl(), chrono::Duration::minutes(30));
    assert!(config.storage.path.is_none());
  }

  #[test]
  fn test_partial_sections_keep_defaults() {
    let config = Config::parse(
      r#"
api:
  base_url: https://api.example.com
queue:
  payment_max_retries: 8
retry:
  base_delay_secs: 5
cache:
  schema_version: 4
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url.as_deref(), Some("https://api.example.com"));
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.queue.default_max_retries, 3);
    assert_eq!(config.queue.payment_max_retries, 8);
    assert_eq!(config.retry.policy().base_delay, chrono::Duration::seconds(5));
    assert_eq!(config.retry.policy().max_delay, chrono::Duration::minutes(16));
    assert_eq!(config.cache.schema_version, 4);
    assert_eq!(config.cache.default_ttl_minutes, 30);
  }

  #[test]
  fn test_load_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agrosync.yaml");
    std::fs::write(&path, "storage:\n  path: /tmp/agro.db\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.storage.path, Some(PathBuf::from("/tmp/agro.db")));
    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_unknown_types_are_rejected() {
    assert!(Config::parse("api:\n  timeout_secs: soon\n").is_err());
  }
}

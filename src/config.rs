use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  /// Name recorded as the author of version snapshots (defaults to "local")
  pub user: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the clause service, e.g. "https://clauses.example.com/api/"
  pub url: String,
  /// Per-request timeout
  #[serde(default = "default_request_timeout_ms", alias = "requestTimeoutMs")]
  pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
  10_000
}

impl ApiConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Database location (default: $XDG_DATA_HOME/clausebook/cache.db)
  pub path: Option<PathBuf>,
  /// Age after which the cached collection is refetched in the foreground
  #[serde(alias = "freshnessThresholdMs")]
  pub freshness_threshold_ms: u64,
  /// Length of the per-record sliding window of use timestamps
  #[serde(alias = "maxRecentUses")]
  pub max_recent_uses: usize,
  /// Records need strictly more uses than this to count as frequently used
  #[serde(alias = "mostFrequentMinCount")]
  pub most_frequent_min_count: u64,
  /// Snapshot count returned by history queries when the caller gives no limit
  #[serde(alias = "maxVersionsReturnedDefault")]
  pub max_versions_returned_default: usize,
  /// Snapshots kept per record; unset keeps every snapshot
  #[serde(alias = "maxVersionsRetained")]
  pub max_versions_retained: Option<usize>,
  /// SQLite page cap, acts as the storage quota
  #[serde(alias = "maxDbPages")]
  pub max_db_pages: Option<u32>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      path: None,
      freshness_threshold_ms: 300_000,
      max_recent_uses: 50,
      most_frequent_min_count: 1,
      max_versions_returned_default: 20,
      max_versions_retained: None,
      max_db_pages: None,
    }
  }
}

impl CacheConfig {
  pub fn freshness_threshold(&self) -> Duration {
    Duration::from_millis(self.freshness_threshold_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// When false every mutation is queued in the outbox
  pub enabled: bool,
  /// Seconds between background drain cycles
  pub interval_secs: u64,
  /// Attempts after which an operation is parked for the user to resolve
  pub max_attempts: u32,
  /// Keep replaying unrelated operations after one fails
  pub continue_on_failure: bool,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      interval_secs: 60,
      max_attempts: 10,
      continue_on_failure: true,
      backoff_base_ms: 2_000,
      backoff_max_ms: 300_000,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Log directory (default: $XDG_DATA_HOME/clausebook/logs)
  pub dir: Option<PathBuf>,
  /// tracing filter directive, overridden by CLAUSEBOOK_LOG
  pub filter: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./clausebook.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/clausebook/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(CacheError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(CacheError::Config(
        "No configuration file found. Create one at ~/.config/clausebook/config.yaml".to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("clausebook.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("clausebook").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      CacheError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::parse(&contents).map_err(|e| match e {
      CacheError::Config(msg) => CacheError::Config(format!("{}: {}", path.display(), msg)),
      other => other,
    })
  }

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents)
      .map_err(|e| CacheError::Config(format!("Failed to parse config: {}", e)))
  }

  /// Author name recorded on version snapshots.
  pub fn author(&self) -> String {
    self.user.clone().unwrap_or_else(|| "local".to_string())
  }

  /// Get the bearer token for the clause service from the environment.
  ///
  /// Checks CLAUSEBOOK_API_TOKEN; the service may also be used unauthenticated.
  pub fn api_token() -> Option<String> {
    std::env::var("CLAUSEBOOK_API_TOKEN").ok()
  }
}

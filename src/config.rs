use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::invalidation::{default_rules, validate_pattern, InvalidationRule};
use crate::resources::{
  default_critical_resources, default_idle_resources, default_warm_resources, ResourceSpec,
};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub retry: RetryPolicy,
  pub queue: QueueConfig,
  pub sync: SyncConfig,
  pub metrics: MetricsConfig,
  /// Replaces the built-in invalidation table when set
  pub invalidation: Option<Vec<InvalidationRule>>,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  /// Per-call timeout for every network request
  pub request_timeout_secs: u64,
  /// Path checked to detect connectivity
  pub health_path: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/".to_string(),
      request_timeout_secs: 10,
      health_path: "/health".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Entries written by another version are treated as absent
  pub schema_version: String,
  pub default_ttl_secs: u64,
  pub sweep_interval_secs: u64,
  pub backend: StorageBackend,
  /// SQLite file; defaults to the user data directory
  pub path: Option<PathBuf>,
}

/// Where cache and queue state live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  #[default]
  Sqlite,
  /// Lost on exit
  Memory,
  /// Nothing is stored; every read misses
  Disabled,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      schema_version: env!("CARGO_PKG_VERSION").to_string(),
      default_ttl_secs: 300,
      sweep_interval_secs: 30 * 60,
      backend: StorageBackend::Sqlite,
      path: None,
    }
  }
}

/// Sweep interval bounds.
const MIN_SWEEP: Duration = Duration::from_secs(30 * 60);
const MAX_SWEEP: Duration = Duration::from_secs(60 * 60);

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  /// Sweep interval clamped to 30-60 minutes.
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs).clamp(MIN_SWEEP, MAX_SWEEP)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Safety-net drain period
  pub drain_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      drain_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub background_interval_secs: u64,
  pub idle_threshold_secs: u64,
  /// Timeout for each startup prefetch
  pub warm_timeout_secs: u64,
  pub health_check_interval_secs: u64,
  pub warm: Vec<ResourceSpec>,
  pub critical: Vec<ResourceSpec>,
  pub idle: Vec<ResourceSpec>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      background_interval_secs: 120,
      idle_threshold_secs: 30,
      warm_timeout_secs: 5,
      health_check_interval_secs: 15,
      warm: default_warm_resources(),
      critical: default_critical_resources(),
      idle: default_idle_resources(),
    }
  }
}

impl SyncConfig {
  pub fn background_interval(&self) -> Duration {
    Duration::from_secs(self.background_interval_secs)
  }

  pub fn idle_threshold(&self) -> Duration {
    Duration::from_secs(self.idle_threshold_secs)
  }

  pub fn warm_timeout(&self) -> Duration {
    Duration::from_secs(self.warm_timeout_secs)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.health_check_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
  /// Latency samples kept per category
  pub window_size: usize,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self { window_size: 100 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Directory for daily log files; stderr only when unset
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tracker-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tracker-sync/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tracker-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tracker-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Reject settings the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    let retry = &self.retry;
    if retry.backoff_factor < 1.0 {
      return Err(eyre!("retry.backoff_factor must be >= 1"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
      return Err(eyre!("retry.base_delay_ms must not exceed retry.max_delay_ms"));
    }
    if retry.read_max_attempts == 0 || retry.mutation_max_attempts == 0 {
      return Err(eyre!("retry attempt budgets must be at least 1"));
    }

    let intervals = [
      ("queue.drain_interval_secs", self.queue.drain_interval_secs),
      ("sync.background_interval_secs", self.sync.background_interval_secs),
      ("sync.idle_threshold_secs", self.sync.idle_threshold_secs),
      ("sync.health_check_interval_secs", self.sync.health_check_interval_secs),
      ("api.request_timeout_secs", self.api.request_timeout_secs),
    ];
    if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
      return Err(eyre!("{} must be greater than zero", name));
    }

    for rule in self.invalidation_rules() {
      for pattern in &rule.affected_key_patterns {
        validate_pattern(pattern).map_err(|e| eyre!("Invalid invalidation rule: {}", e))?;
      }
    }

    Ok(())
  }

  pub fn invalidation_rules(&self) -> Vec<InvalidationRule> {
    self.invalidation.clone().unwrap_or_else(default_rules)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks TRACKER_SYNC_TOKEN. The API may be used anonymously.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TRACKER_SYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

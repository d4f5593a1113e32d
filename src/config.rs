use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub idempotency: IdempotencyConfig,
  #[serde(default)]
  pub transfer: TransferConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  #[serde(default = "default_backend_url")]
  pub url: String,
  /// Username for password login (password comes from the environment)
  pub username: Option<String>,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: default_backend_url(),
      username: None,
    }
  }
}

fn default_backend_url() -> String {
  "http://localhost:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds a read result is served without revalidation
  pub stale_time_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 5 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
  pub retention_hours: u64,
  /// Completed records kept before oldest-first eviction kicks in
  pub max_entries: usize,
}

impl Default for IdempotencyConfig {
  fn default() -> Self {
    Self {
      retention_hours: 24,
      max_entries: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
  /// Fresh tokens requested per transfer before giving up on expiry
  pub max_token_attempts: u32,
}

impl Default for TransferConfig {
  fn default() -> Self {
    Self {
      max_token_attempts: 3,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// Database location (default: $XDG_DATA_HOME/vaultcache/offline.db)
  pub path: Option<PathBuf>,
  /// Drop pinned files on logout / credential expiry
  pub clear_on_logout: bool,
  /// How long to wait for another process holding the store
  pub busy_timeout_secs: u64,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      path: None,
      clear_on_logout: false,
      busy_timeout_secs: 5,
    }
  }
}

impl OfflineConfig {
  pub fn busy_timeout(&self) -> Duration {
    Duration::from_secs(self.busy_timeout_secs)
  }

  /// Resolve the database path, falling back to the data directory.
  pub fn resolve_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("offline.db"))
  }
}

/// Application data directory ($XDG_DATA_HOME/vaultcache).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("vaultcache"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vaultcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vaultcache/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
      None => {
        tracing::info!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("vaultcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("vaultcache").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.cache.stale_time_secs as i64)
  }

  pub fn idempotency_retention(&self) -> chrono::Duration {
    chrono::Duration::hours(self.idempotency.retention_hours as i64)
  }

  /// Get a pre-issued bearer token from the environment.
  pub fn get_token() -> Option<String> {
    std::env::var("VAULTCACHE_TOKEN").ok().filter(|t| !t.is_empty())
  }

  /// Get the login password from the environment.
  pub fn get_password() -> Result<String> {
    std::env::var("VAULTCACHE_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set VAULTCACHE_PASSWORD or VAULTCACHE_TOKEN."))
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::db::Database;
use crate::drive::{KNOWN_QUERIES, VOLATILE_QUERIES};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub database: DatabaseConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Persisted key prefix
  pub prefix: String,
  /// Bump after an incompatible change to persisted data
  pub version: u32,
  pub stale_time_secs: u64,
  /// Query names restored from disk on startup
  pub known_queries: Vec<String>,
  /// Query names never written to disk
  pub volatile_queries: Vec<String>,
  /// Write queries through to the local database
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "queryClient".to_string(),
      version: 1,
      stale_time_secs: 60,
      known_queries: KNOWN_QUERIES.iter().map(|s| s.to_string()).collect(),
      volatile_queries: VOLATILE_QUERIES.iter().map(|s| s.to_string()).collect(),
      persist: true,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_time_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
  /// Defaults to `<data dir>/vaultcache/cache.db`
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  /// Also write daily-rotated log files here
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./vaultcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/vaultcache/config.yaml
  ///
  /// Defaults are used when no file is found.
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
        debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("vaultcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
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

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Resolved database location.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database.path {
      Some(path) => Ok(path.clone()),
      None => Database::default_path().map_err(|e| eyre!("Failed to locate database: {}", e)),
    }
  }
}

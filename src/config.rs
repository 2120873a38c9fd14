use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::FetchPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the clients are served from; relative URLs resolve against it
  pub origin: Url,
  /// Prefix of every cache generation name
  pub cache_prefix: String,
  /// Version label of the current worker generation (e.g. "v10")
  pub version_tag: String,
  /// Resources that must be cached for an install to succeed
  pub app_shell: Vec<String>,
  /// Endpoint returning `{ "version": "..." }`
  pub version_endpoint: String,
  pub poll_interval_secs: u64,
  /// Minimum gap between visibility-triggered checks across all instances
  pub visibility_cooldown_secs: u64,
  pub check_timeout_secs: u64,
  pub storage: StorageKind,
  /// Database path (default: $XDG_DATA_HOME/swcache/store.db)
  pub db_path: Option<PathBuf>,
  pub fetch: FetchPolicy,
  /// Write paths that are queued when the network is down
  pub queue_paths: Vec<String>,
  /// Lifetime of API responses kept for offline reads
  pub data_ttl_secs: u64,
  pub data_max_entries: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Lost when the process exits
  Memory,
  /// Writes discarded, reads miss (private browsing equivalent)
  Disabled,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:5000").expect("static URL is valid"),
      cache_prefix: "crm-cache".to_string(),
      version_tag: "v10".to_string(),
      app_shell: vec![
        "/".to_string(),
        "/static/manifest.json".to_string(),
        "/static/icon-192.png".to_string(),
        "/static/icon-512.png".to_string(),
        "https://cdn.socket.io/4.5.4/socket.io.min.js".to_string(),
      ],
      version_endpoint: "/api/version".to_string(),
      poll_interval_secs: 60,
      visibility_cooldown_secs: 5 * 60,
      check_timeout_secs: 10,
      storage: StorageKind::default(),
      db_path: None,
      fetch: FetchPolicy::default(),
      queue_paths: vec![
        "/api/reminders".to_string(),
        "/api/chats".to_string(),
        "/api/messages".to_string(),
      ],
      data_ttl_secs: 5 * 60,
      data_max_entries: 50,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Without any file the built-in defaults are used.
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
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    if self.version_tag.trim().is_empty() {
      return Err(eyre!("version_tag must not be empty"));
    }
    if self.poll_interval_secs == 0 {
      return Err(eyre!("poll_interval_secs must be positive"));
    }
    // A zero timeout would fail every version check before it starts
    if self.check_timeout_secs == 0 {
      return Err(eyre!("check_timeout_secs must be positive"));
    }
    if self.data_ttl_secs == 0 {
      return Err(eyre!("data_ttl_secs must be positive"));
    }
    if self.data_max_entries == 0 {
      return Err(eyre!("data_max_entries must be positive"));
    }
    self.version_url()?;
    Ok(())
  }

  /// Name of the cache generation owned by the configured worker.
  pub fn generation_tag(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version_tag)
  }

  pub fn version_url(&self) -> Result<Url> {
    self
      .origin
      .join(&self.version_endpoint)
      .map_err(|e| eyre!("Invalid version endpoint '{}': {}", self.version_endpoint, e))
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs)
  }

  pub fn visibility_cooldown(&self) -> Duration {
    Duration::from_secs(self.visibility_cooldown_secs)
  }

  pub fn check_timeout(&self) -> Duration {
    Duration::from_secs(self.check_timeout_secs)
  }

  pub fn data_ttl(&self) -> chrono::Duration {
    let secs = u32::try_from(self.data_ttl_secs).unwrap_or(u32::MAX);
    chrono::Duration::seconds(i64::from(secs))
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::DEFAULT_MAX_ATTEMPTS;
use crate::worker::Manifest;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Where the local store and response cache live (defaults to $XDG_DATA_HOME/gym-sync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  /// Path polled to decide whether the server is reachable
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Login page the server redirects to when the session is missing or expired
  #[serde(default = "default_auth_path")]
  pub auth_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace prefix for cache generations
  pub prefix: String,
  /// Deploy version; bump it to roll out a new generation
  pub version: String,
  /// Critical assets primed on install
  pub manifest: Vec<String>,
  /// Served to navigations that neither network nor cache can answer
  pub fallback_page: String,
  pub refresh_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "gym-manager".to_string(),
      version: "v1".to_string(),
      manifest: [
        "/",
        "/dashboard",
        "/add_member",
        "/static/css/style.css",
        "/static/js/main.js",
        "/static/js/offline-db.js",
        "/static/icons/icon-192.png",
        "/static/icons/icon-512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      fallback_page: "/dashboard".to_string(),
      refresh_interval_secs: 60 * 60,
    }
  }
}

impl CacheConfig {
  /// Versioned generation name, e.g. `gym-manager-v3`.
  pub fn generation(&self) -> String {
    format!("{}-{}", self.prefix, self.version)
  }

  pub fn manifest(&self) -> Manifest {
    Manifest {
      generation: self.generation(),
      entries: self.manifest.clone(),
      fallback_page: self.fallback_page.clone(),
    }
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.refresh_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Failed attempts after which a queued action is reported as stuck
  pub max_attempts: u32,
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      probe_interval_secs: 15,
    }
  }
}

impl SyncConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

fn default_health_path() -> String {
  "/health".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_auth_path() -> String {
  "/auth".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gym-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gym-sync/config.yaml
  ///
  /// `GYM_SYNC_SERVER_URL` overrides `server.url`.
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
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/gym-sync/config.yaml\n\
                 with at least `server: {{ url: http://localhost:5000 }}`."
        ))
      }
    };

    Ok(config.with_server_url(std::env::var("GYM_SYNC_SERVER_URL").ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("gym-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gym-sync").join("config.yaml");
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
    if config.cache.manifest.is_empty() {
      return Err(eyre!("cache.manifest must list at least one entry"));
    }
    if !config.cache.manifest.contains(&config.cache.fallback_page) {
      return Err(eyre!(
        "cache.fallback_page {} must be part of cache.manifest",
        config.cache.fallback_page
      ));
    }
    Ok(config)
  }

  fn with_server_url(mut self, url: Option<String>) -> Self {
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
      self.server.url = url;
    }
    self
  }

  /// Directory holding the local store, the response cache and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("gym-sync"))
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("store.db"))
  }

  pub fn responses_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("responses.db"))
  }

  /// Get the session cookie sent with server requests.
  ///
  /// Reads GYM_SYNC_SESSION; requests go out unauthenticated without it.
  pub fn get_session() -> Option<String> {
    std::env::var("GYM_SYNC_SESSION")
      .ok()
      .filter(|s| !s.is_empty())
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Tier;

/// Tag carried by reconnect triggers that start a queue replay.
pub const SYNC_TAG: &str = "sync-post-requests";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Address the proxy listens on
  pub listen: SocketAddr,
  /// Base URL of the catalog API
  pub origin: Url,
  /// Path of the catalog collection on the origin
  pub collection_path: String,
  /// Where databases and logs live (defaults to $XDG_DATA_HOME/catalog-proxy)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  pub monitor: MonitorConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
      origin: Url::parse("http://localhost:3000/").expect("static URL"),
      collection_path: "/items".to_string(),
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      monitor: MonitorConfig::default(),
    }
  }
}

/// Cache generation names and install manifests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Generation suffix; bumping it makes `activate` purge older generations
  pub version: String,
  /// Same-origin asset paths installed into the static tier
  pub static_files: Vec<String>,
  /// Absolute third-party URLs installed into the immutable tier
  pub immutable_files: Vec<String>,
  /// Served to HTML requests when both cache and network miss
  pub offline_page: String,
  /// Served to image requests when both cache and network miss
  pub error_image: String,
}

impl CacheConfig {
  /// Name of the current generation for `tier`, e.g. `static-cache-v1.1`.
  pub fn generation_name(&self, tier: Tier) -> String {
    format!("{}-cache-{}", tier.as_str(), self.version)
  }

  pub fn current_generations(&self) -> Vec<String> {
    Tier::ALL
      .iter()
      .map(|tier| self.generation_name(*tier))
      .collect()
  }

  /// Install manifest for a tier. The dynamic tier has none.
  pub fn manifest(&self, tier: Tier) -> &[String] {
    match tier {
      Tier::Static => &self.static_files,
      Tier::Immutable => &self.immutable_files,
      Tier::Dynamic => &[],
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    let static_files = [
      "/",
      "/index.html",
      "/js/app.js",
      "/js/datos.js",
      "/manifest.json",
      "/pages/recent.html",
      "/pages/offline.html",
      "/images/error.png",
      "/images/icons/android-launchericon-192-192.png",
      "/images/icons/android-launchericon-512-512.png",
    ];
    let immutable_files = [
      "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.2.0/css/all.min.css",
      "https://cdn.jsdelivr.net/npm/bootstrap@5.2.1/dist/js/bootstrap.bundle.min.js",
    ];

    Self {
      version: "v1.1".to_string(),
      static_files: static_files.iter().map(|s| s.to_string()).collect(),
      immutable_files: immutable_files.iter().map(|s| s.to_string()).collect(),
      offline_page: "/pages/offline.html".to_string(),
      error_image: "/images/error.png".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Reconnect triggers with any other tag are ignored
  pub tag: String,
  /// Upper bound on a single replay attempt
  pub replay_timeout_secs: u64,
  pub backoff: BackoffConfig,
  /// Capacity of the client notification channel
  pub notification_capacity: usize,
}

impl SyncConfig {
  pub fn replay_timeout(&self) -> Duration {
    Duration::from_secs(self.replay_timeout_secs)
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: SYNC_TAG.to_string(),
      replay_timeout_secs: 30,
      backoff: BackoffConfig::default(),
      notification_capacity: 64,
    }
  }
}

/// Per-record replay backoff. Failed records are never dropped; they only
/// wait longer before the next attempt.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
  pub enabled: bool,
  pub base_secs: u64,
  pub max_secs: u64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      base_secs: 2,
      max_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 15 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
  pub enabled: bool,
  pub interval_secs: u64,
}

impl MonitorConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      interval_secs: 10,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./catalog-proxy.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/catalog-proxy/config.yaml
  ///
  /// Without a file the built-in defaults are used.
  /// `CATALOG_PROXY_ORIGIN` overrides the origin either way.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Ok(origin) = std::env::var("CATALOG_PROXY_ORIGIN") {
      config.origin = Url::parse(&origin)
        .map_err(|e| eyre!("Invalid CATALOG_PROXY_ORIGIN '{}': {}", origin, e))?;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("catalog-proxy.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("catalog-proxy").join("config.yaml");
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

  /// Directory holding the queue database, cache database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("catalog-proxy"))
  }

  /// Absolute URL of the catalog collection on the origin.
  pub fn collection_url(&self) -> Result<Url> {
    self
      .origin
      .join(&self.collection_path)
      .map_err(|e| eyre!("Invalid collection path '{}': {}", self.collection_path, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_generation_names() {
    let config = CacheConfig::default();
    assert_eq!(
      config.current_generations(),
      vec![
        "static-cache-v1.1".to_string(),
        "dynamic-cache-v1.1".to_string(),
        "immutable-cache-v1.1".to_string(),
      ]
    );
    assert!(config.static_files.contains(&config.offline_page));
    assert!(config.static_files.contains(&config.error_image));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "http://catalog.test:3000/"
cache:
  version: v2
sync:
  backoff:
    enabled: false
"#,
    )
    .unwrap();

    assert_eq!(config.origin.as_str(), "http://catalog.test:3000/");
    assert_eq!(config.cache.generation_name(Tier::Dynamic), "dynamic-cache-v2");
    assert_eq!(config.cache.static_files.len(), 10);
    assert!(!config.sync.backoff.enabled);
    assert_eq!(config.sync.tag, SYNC_TAG);
    assert_eq!(
      config.collection_url().unwrap().as_str(),
      "http://catalog.test:3000/items"
    );
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    let missing = Path::new("/definitely/not/here.yaml");
    assert!(Config::load(Some(missing)).is_err());
  }
}

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CachePolicy, PartitionLimits};
use crate::notify::NotificationPrefs;
use crate::store::Domain;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Stamped on every record this device creates
  pub owner_id: String,
  /// Where the record store, cache and logs live (defaults to $XDG_DATA_HOME/floorsync)
  pub data_dir: Option<PathBuf>,
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  pub notifications: NotificationPrefs,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      owner_id: "floor-device".to_string(),
      data_dir: None,
      sync: SyncConfig::default(),
      cache: CacheConfig::default(),
      notifications: NotificationPrefs::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Periodic sync interval
  pub interval_secs: u64,
  /// Bound on a single remote submission
  pub submit_timeout_secs: u64,
  /// Synced records older than this are purged
  pub retention_days: u32,
  /// Remote endpoint per domain; domains without one are never submitted
  pub endpoints: HashMap<Domain, Url>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 300,
      submit_timeout_secs: 30,
      retention_days: 30,
      endpoints: HashMap::new(),
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs)
  }

  pub fn submit_timeout(&self) -> Duration {
    Duration::from_secs(self.submit_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false every request goes straight to the network
  pub enabled: bool,
  /// Build version; changing it drops every older cache on activation
  pub version: String,
  /// Only requests to this origin are cached
  pub origin: String,
  pub fetch_timeout_secs: u64,
  pub max_static: usize,
  pub max_dynamic: usize,
  pub max_image: usize,
  pub static_assets: Vec<String>,
  pub offline_page: Option<String>,
  /// How often the origin is probed for reachability
  pub probe_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let limits = PartitionLimits::default();
    Self {
      enabled: true,
      version: "v1".to_string(),
      origin: "http://localhost:8080".to_string(),
      fetch_timeout_secs: 10,
      max_static: limits.static_max,
      max_dynamic: limits.dynamic_max,
      max_image: limits.image_max,
      static_assets: ["/", "/index.html", "/css/styles.css", "/js/app.js", "/manifest.json"]
        .into_iter()
        .map(String::from)
        .collect(),
      offline_page: Some("/offline.html".to_string()),
      probe_interval_secs: 30,
    }
  }
}

impl CacheConfig {
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid cache origin '{}': {}", self.origin, e))
  }

  pub fn policy(&self) -> Result<CachePolicy> {
    Ok(CachePolicy {
      version: self.version.clone(),
      origin: self.origin()?,
      limits: PartitionLimits {
        static_max: self.max_static,
        dynamic_max: self.max_dynamic,
        image_max: self.max_image,
      },
      static_assets: self.static_assets.clone(),
      offline_page: self.offline_page.clone(),
    })
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./floorsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/floorsync/config.yaml
  ///
  /// Falls back to defaults when nothing is found. `FLOORSYNC_OWNER` overrides
  /// `owner_id` either way.
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

    if let Ok(owner) = std::env::var("FLOORSYNC_OWNER") {
      config.owner_id = owner;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("floorsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("floorsync").join("config.yaml");
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

  /// Resolve the data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("floorsync"))
  }

  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("records.db"))
  }

  pub fn cache_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("logs"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_file_keeps_defaults() {
    let yaml = r#"
owner_id: dock-3
sync:
  submit_timeout_secs: 5
  endpoints:
    receipt: https://erp.example.com/api/receipts
    sync_queue: https://erp.example.com/api/queue
cache:
  version: v7
  max_image: 10
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.owner_id, "dock-3");
    assert_eq!(config.sync.interval_secs, 300);
    assert_eq!(config.sync.submit_timeout(), Duration::from_secs(5));
    assert_eq!(config.sync.endpoints.len(), 2);
    assert_eq!(
      config.sync.endpoints[&Domain::Receipt].as_str(),
      "https://erp.example.com/api/receipts"
    );

    let policy = config.cache.policy().unwrap();
    assert_eq!(policy.version, "v7");
    assert_eq!(policy.limits.image_max, 10);
    assert_eq!(policy.limits.dynamic_max, 50);
    assert!(config.cache.enabled);
  }

  #[test]
  fn test_bad_origin_is_reported() {
    let config: Config = serde_yaml::from_str("cache:\n  origin: not a url\n").unwrap();
    assert!(config.cache.policy().is_err());
  }

  #[test]
  fn test_negative_retention_is_rejected() {
    assert!(serde_yaml::from_str::<Config>("sync:\n  retention_days: -1\n").is_err());
  }

  #[test]
  fn test_unknown_domain_is_rejected() {
    let yaml = "sync:\n  endpoints:\n    pallets: https://erp.example.com/p\n";
    assert!(serde_yaml::from_str::<Config>(yaml).is_err());
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_load_from_file_and_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("floorsync.yaml");
    let data_dir = dir.path().join("data");
    std::fs::write(
      &path,
      format!("data_dir: {}\ncache:\n  enabled: false\n", data_dir.display()),
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert!(!config.cache.enabled);
    assert_eq!(config.store_path().unwrap(), data_dir.join("records.db"));
    assert_eq!(config.cache_path().unwrap(), data_dir.join("cache.db"));
  }
}

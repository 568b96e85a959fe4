use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin whose traffic is cached, e.g. `https://shop.example.com`
  pub origin: String,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: String,
  /// Pass absolute-form requests for other hosts upstream. Off by default;
  /// turning it on with a non-loopback `listen` makes this an open proxy.
  #[serde(default)]
  pub forward_proxy: bool,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Per-request network timeout in seconds
  #[serde(default = "default_fetch_timeout")]
  pub fetch_timeout_secs: u64,
  /// Largest request body accepted from clients
  #[serde(default = "default_max_body")]
  pub max_body_bytes: usize,
  /// Directory for rolling log files (stderr only when unset)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// Label of the current generation. Change it whenever the manifest or
  /// caching policy changes so older stores get pruned.
  #[serde(default = "default_version")]
  pub version: String,
  /// Paths fetched into the current store at install
  #[serde(default = "default_manifest")]
  pub manifest: Vec<String>,
  /// Page served to navigations while offline; must appear in the manifest
  #[serde(default = "default_offline_path")]
  pub offline_path: String,
  /// Extensions (without the dot) eligible for write-back, case-insensitive
  #[serde(
    default = "default_extensions",
    deserialize_with = "deserialize_lowercase_set"
  )]
  pub cacheable_extensions: BTreeSet<String>,
  /// SQLite database path (default: $XDG_DATA_HOME/offline-proxy/stores.db)
  pub database: Option<PathBuf>,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      version: default_version(),
      manifest: default_manifest(),
      offline_path: default_offline_path(),
      cacheable_extensions: default_extensions(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Tags this process knows how to drain
  #[serde(default = "default_sync_tags")]
  pub tags: Vec<String>,
  /// Seconds between connectivity probes
  #[serde(default = "default_sync_interval")]
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tags: default_sync_tags(),
      interval_secs: default_sync_interval(),
    }
  }
}

fn default_listen() -> String {
  "127.0.0.1:8080".to_string()
}

fn default_fetch_timeout() -> u64 {
  30
}

fn default_max_body() -> usize {
  10 * 1024 * 1024
}

fn default_version() -> String {
  "juiceville-v1.3".to_string()
}

fn default_manifest() -> Vec<String> {
  [
    "/",
    "/static/orders/css/bootstrap.min.css",
    "/static/orders/css/style.css",
    "/static/orders/css/mobile-responsive.css",
    "/static/orders/js/mobile-responsive.js",
    "/static/orders/img/favicon.ico",
    "/static/orders/img/apple-touch-icon.png",
    "/offline/",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_offline_path() -> String {
  "/offline/".to_string()
}

fn default_extensions() -> BTreeSet<String> {
  [
    "css", "js", "png", "jpg", "jpeg", "gif", "ico", "woff", "woff2", "ttf", "eot", "svg",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_sync_tags() -> Vec<String> {
  vec!["background-sync".to_string()]
}

fn default_sync_interval() -> u64 {
  30
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Config {
  /// Build a configuration for `origin` with every other setting defaulted.
  pub fn for_origin(origin: impl Into<String>) -> Self {
    Self {
      origin: origin.into(),
      listen: default_listen(),
      forward_proxy: false,
      store: StoreConfig::default(),
      sync: SyncConfig::default(),
      fetch_timeout_secs: default_fetch_timeout(),
      max_body_bytes: default_max_body(),
      log_dir: None,
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-proxy.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-proxy/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offline-proxy/config.yaml \
         or pass --origin"
      )),
    }
  }

  /// Like [`Config::load`], but with no file found and an `--origin` given,
  /// fall back to the defaults for that origin.
  pub fn load_or_origin(explicit_path: Option<&Path>, origin: Option<&str>) -> Result<Self> {
    match (explicit_path, origin) {
      (None, Some(origin)) if Self::find_config_file().is_none() => {
        Ok(Self::for_origin(origin))
      }
      _ => Self::load(explicit_path),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offline-proxy.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-proxy").join("config.yaml");
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
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Check the invariants the proxy relies on at runtime.
  pub fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if origin.cannot_be_a_base() || !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("origin must be an http(s) URL, got {}", self.origin));
    }

    if self.store.version.trim().is_empty() {
      return Err(eyre!("store.version must not be empty"));
    }

    for path in &self.store.manifest {
      if !path.starts_with('/') {
        return Err(eyre!("manifest entries must be absolute paths, got {}", path));
      }
    }

    let offline_entries = self
      .store
      .manifest
      .iter()
      .filter(|p| **p == self.store.offline_path)
      .count();
    if offline_entries != 1 {
      return Err(eyre!(
        "manifest must contain the offline page {} exactly once (found {})",
        self.store.offline_path,
        offline_entries
      ));
    }

    if self.sync.interval_secs == 0 {
      return Err(eyre!("sync.interval_secs must be greater than 0"));
    }

    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs)
  }

  /// Resolve the database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.store.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-proxy").join("stores.db"))
  }
}

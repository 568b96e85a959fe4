//! Store generations: populate the current one at install, prune the rest at
//! activation.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use super::storage::VersionedStore;
use super::traits::CachedEntry;
use crate::config::Config;
use crate::error::ProxyError;
use crate::event::EventContext;
use crate::proxy::{Fetcher, ProxyRequest, RequestIdentity};

/// The current store exists and holds the whole manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
  pub version: String,
  pub entries: usize,
}

pub struct StoreLifecycleManager<S: VersionedStore> {
  store: Arc<S>,
  version: String,
  manifest: Vec<Url>,
  controlling: watch::Sender<bool>,
}

impl<S: VersionedStore> StoreLifecycleManager<S> {
  pub fn new(store: Arc<S>, config: &Config) -> Result<Self> {
    let origin = config.origin_url()?;
    let manifest = config
      .store
      .manifest
      .iter()
      .map(|path| {
        origin
          .join(path)
          .map_err(|e| eyre!("Invalid manifest path {}: {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      store,
      version: config.store.version.clone(),
      manifest,
      controlling: watch::Sender::new(false),
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Open the current store and fetch the manifest into it.
  ///
  /// All manifest fetches must succeed (any network failure or non-2xx
  /// status fails the whole operation). Entries already written when a
  /// store write fails are left in place; the next install retries.
  pub async fn ensure_current_store<F: Fetcher>(
    &self,
    fetcher: &F,
    ctx: &EventContext,
  ) -> Result<Ready, ProxyError> {
    self
      .store
      .open(&self.version)
      .map_err(|e| ProxyError::PopulationFailed {
        url: self.version.clone(),
        reason: format!("could not open store: {}", e),
      })?;
    info!("Opened store {}", self.version);

    let fetches = self.manifest.iter().map(|url| async move {
      let result = tokio::select! {
        _ = ctx.done() => Err(ProxyError::network(url.as_str(), "cancelled")),
        result = fetcher.fetch(ProxyRequest::get(url.clone())) => result,
      };

      let response = result.map_err(|e| ProxyError::PopulationFailed {
        url: url.to_string(),
        reason: e.to_string(),
      })?;

      if !response.status.is_success() {
        return Err(ProxyError::PopulationFailed {
          url: url.to_string(),
          reason: format!("status {}", response.status),
        });
      }

      Ok(CachedEntry::from_response(
        RequestIdentity::get(url),
        &response,
      ))
    });

    let entries = try_join_all(fetches).await?;
    if ctx.is_cancelled() {
      return Err(ProxyError::PopulationFailed {
        url: self.version.clone(),
        reason: "install cancelled before the store was written".to_string(),
      });
    }

    for entry in &entries {
      self
        .store
        .put(&self.version, entry)
        .map_err(|e| ProxyError::PopulationFailed {
          url: entry.identity.url.clone(),
          reason: e.to_string(),
        })?;
    }

    info!(
      "Populated store {} with {} manifest entries",
      self.version,
      entries.len()
    );

    Ok(Ready {
      version: self.version.clone(),
      entries: entries.len(),
    })
  }

  /// Delete every store not named by the current version.
  ///
  /// Returns the deleted names, oldest first. Running it again with nothing
  /// stale returns an empty list.
  pub fn prune_stale_stores(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.store.names()? {
      if name == self.version {
        continue;
      }
      info!("Deleting stale store {}", name);
      if self.store.delete(&name)? {
        deleted.push(name);
      } else {
        warn!("Store {} vanished before it could be deleted", name);
      }
    }

    Ok(deleted)
  }

  /// Mark this process as authoritative for request handling.
  pub fn claim(&self) {
    if !self.controlling.send_replace(true) {
      info!("Claimed control with store {}", self.version);
    }
  }

  pub fn is_controlling(&self) -> bool {
    *self.controlling.borrow()
  }

  /// Observe the controlling flag.
  #[cfg(test)]
  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.controlling.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::proxy::ProxyResponse;
  use async_trait::async_trait;
  use reqwest::StatusCode;
  use std::collections::HashSet;

  /// Serves `<path>` as its own body unless the path is listed as failing.
  struct ManifestFetcher {
    offline: HashSet<String>,
    not_found: HashSet<String>,
  }

  impl ManifestFetcher {
    fn healthy() -> Self {
      Self {
        offline: HashSet::new(),
        not_found: HashSet::new(),
      }
    }
  }

  #[async_trait]
  impl Fetcher for ManifestFetcher {
    async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
      let path = request.url.path().to_string();
      if self.offline.contains(&path) {
        return Err(ProxyError::network(request.url.as_str(), "offline"));
      }
      if self.not_found.contains(&path) {
        return Ok(ProxyResponse::text(StatusCode::NOT_FOUND, "missing"));
      }
      let mut resp = ProxyResponse::text(StatusCode::OK, "ok");
      resp.body = path.into_bytes().into();
      Ok(resp)
    }
  }

  fn manager(version: &str) -> (Arc<SqliteStore>, StoreLifecycleManager<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut config = Config::for_origin("http://localhost:8000");
    config.store.version = version.to_string();
    let manager = StoreLifecycleManager::new(store.clone(), &config).unwrap();
    (store, manager)
  }

  fn identity(path: &str) -> RequestIdentity {
    RequestIdentity::get(&Url::parse("http://localhost:8000").unwrap().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_ensure_current_store_populates_manifest() {
    let (store, manager) = manager("v2-current");
    let ready = manager
      .ensure_current_store(&ManifestFetcher::healthy(), &EventContext::detached())
      .await
      .unwrap();

    assert_eq!(ready.version, "v2-current");
    assert_eq!(ready.entries, 8);
    assert_eq!(store.names().unwrap(), vec!["v2-current"]);

    let offline = store.get("v2-current", &identity("/offline/")).unwrap().unwrap();
    assert_eq!(&offline.body[..], b"/offline/");
  }

  #[tokio::test]
  async fn test_population_fails_when_any_fetch_fails() {
    let (store, manager) = manager("v1");
    let mut fetcher = ManifestFetcher::healthy();
    fetcher.offline.insert("/static/orders/css/style.css".to_string());

    let err = manager
      .ensure_current_store(&fetcher, &EventContext::detached())
      .await
      .unwrap_err();
    assert!(matches!(err, ProxyError::PopulationFailed { ref url, .. } if url.ends_with("style.css")));

    // The store was opened even though population is incomplete
    assert_eq!(store.names().unwrap(), vec!["v1"]);
  }

  #[tokio::test]
  async fn test_population_fails_on_error_status() {
    let (_store, manager) = manager("v1");
    let mut fetcher = ManifestFetcher::healthy();
    fetcher.not_found.insert("/offline/".to_string());

    let err = manager
      .ensure_current_store(&fetcher, &EventContext::detached())
      .await
      .unwrap_err();
    assert!(err.to_string().contains("404"));
  }

  #[tokio::test]
  async fn test_population_fails_when_cancelled() {
    let (_store, manager) = manager("v1");
    let ctx = EventContext::detached();
    ctx.token().cancel();

    struct Hanging;
    #[async_trait]
    impl Fetcher for Hanging {
      async fn fetch(&self, _request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        futures::future::pending().await
      }
    }

    let err = manager.ensure_current_store(&Hanging, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));
  }

  #[test]
  fn test_prune_stale_stores() {
    let (store, manager) = manager("v2-current");
    store.open("v1").unwrap();
    store.open("v2-current").unwrap();

    assert_eq!(manager.prune_stale_stores().unwrap(), vec!["v1"]);
    assert_eq!(store.names().unwrap(), vec!["v2-current"]);

    // Idempotent
    assert!(manager.prune_stale_stores().unwrap().is_empty());
  }

  #[test]
  fn test_claim_flips_controlling() {
    let (_store, manager) = manager("v1");
    let rx = manager.subscribe();
    assert!(!manager.is_controlling());

    manager.claim();
    assert!(manager.is_controlling());
    assert!(*rx.borrow());
  }
}

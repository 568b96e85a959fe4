//! Cache-first request handling with write-back and offline fallbacks.

use reqwest::StatusCode;
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

use super::fetcher::Fetcher;
use super::policy::InterceptionPolicy;
use super::request::{ProxyRequest, RequestIdentity};
use super::response::ProxyResponse;
use super::stats::ProxyStats;
use crate::cache::{CacheMatch, CachedEntry, FetchOutcome, ResponseSource, VersionedStore};
use crate::error::ProxyError;
use crate::event::EventContext;

/// Body of the synthetic response for failed sub-resource fetches.
pub const NETWORK_ERROR_BODY: &str = "Network error happened";

/// Body served when a navigation fails and the offline page is missing.
pub const FALLBACK_UNAVAILABLE_BODY: &str = "Offline page unavailable";

/// Decides, per intercepted request, between the stores and the network.
///
/// This sits between the front end and the upstream fetcher, providing
/// transparent caching of static assets with offline support.
pub struct FetchCoordinator<S: VersionedStore, F: Fetcher> {
  store: Arc<S>,
  fetcher: Arc<F>,
  policy: InterceptionPolicy,
  /// Store that receives write-backs
  current_version: String,
  /// Identity of the offline page
  offline_page: RequestIdentity,
  stats: Arc<ProxyStats>,
}

impl<S, F> FetchCoordinator<S, F>
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  pub fn new(
    store: Arc<S>,
    fetcher: Arc<F>,
    policy: InterceptionPolicy,
    current_version: String,
    offline_page: &Url,
    stats: Arc<ProxyStats>,
  ) -> Self {
    Self {
      store,
      fetcher,
      policy,
      current_version,
      offline_page: RequestIdentity::get(offline_page),
      stats,
    }
  }

  /// Handle an intercepted request.
  ///
  /// 1. Look the request up across every store; a hit is returned as-is
  /// 2. On a miss, fetch a duplicate of the request from the network
  /// 3. Write storable static assets back into the current store
  /// 4. On network failure, serve the offline page (navigations) or a 408
  ///
  /// Never fails: the caller always gets a response.
  pub async fn handle(&self, ctx: &EventContext, request: ProxyRequest) -> FetchOutcome {
    let identity = request.identity();

    if let Some(hit) = self.lookup(&identity) {
      let stale = hit.store != self.current_version;
      if stale {
        debug!(
          "serving {} from stale store {} (current {})",
          identity.url, hit.store, self.current_version
        );
      } else {
        debug!("cache hit {}", identity.url);
      }
      self.stats.record_hit(stale);
      return FetchOutcome::from_cache(&hit);
    }

    self.stats.record_miss();

    let fetched = tokio::select! {
      biased;
      _ = ctx.done() => Err(ProxyError::network(identity.url.as_str(), "cancelled")),
      result = self.fetcher.fetch(request.clone()) => result,
    };

    match fetched {
      Ok(response) => {
        if response.is_storable() && self.policy.is_cacheable_asset(&request.url) {
          self.write_back(ctx, identity, &response);
        }
        FetchOutcome::from_network(response)
      }
      Err(err) => {
        debug!("{}", err);
        self.fallback(&request)
      }
    }
  }

  /// Lookup never fails; store errors count as a miss.
  fn lookup(&self, identity: &RequestIdentity) -> Option<CacheMatch> {
    match self.store.match_any(identity) {
      Ok(hit) => hit,
      Err(e) => {
        warn!("store lookup for {} failed, treating as miss: {}", identity.url, e);
        None
      }
    }
  }

  /// Persist a snapshot without holding up the response.
  fn write_back(&self, ctx: &EventContext, identity: RequestIdentity, response: &ProxyResponse) {
    let entry = CachedEntry::from_response(identity, response);
    let store = Arc::clone(&self.store);
    let stats = Arc::clone(&self.stats);
    let version = self.current_version.clone();

    ctx.wait_until(async move {
      match store.put(&version, &entry) {
        Ok(()) => {
          stats.record_write_back();
          debug!("cached {} in {}", entry.identity.url, version);
        }
        Err(e) => {
          stats.record_write_back_failure();
          let err = ProxyError::WriteBackFailed {
            url: entry.identity.url.clone(),
            reason: e.to_string(),
          };
          warn!(
            store = %version,
            url = %entry.identity.url,
            error = %err,
            "response served uncached"
          );
        }
      }
    });
  }

  fn fallback(&self, request: &ProxyRequest) -> FetchOutcome {
    if !request.is_navigation() {
      self.stats.record_network_error();
      return FetchOutcome::degraded(
        ProxyResponse::text(StatusCode::REQUEST_TIMEOUT, NETWORK_ERROR_BODY),
        ResponseSource::NetworkError,
      );
    }

    match self.lookup(&self.offline_page) {
      Some(hit) => {
        self.stats.record_offline_page();
        FetchOutcome::offline_page(&hit)
      }
      None => {
        self.stats.record_fallback_unavailable();
        let err = ProxyError::FallbackUnavailable {
          path: self.offline_page.url.clone(),
        };
        error!("{} while serving {}", err, request.url);
        FetchOutcome::degraded(
          ProxyResponse::text(StatusCode::SERVICE_UNAVAILABLE, FALLBACK_UNAVAILABLE_BODY),
          ResponseSource::FallbackUnavailable,
        )
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use crate::proxy::request::RequestMode;
  use crate::proxy::ResponseKind;
  use async_trait::async_trait;
  use bytes::Bytes;
  use color_eyre::eyre::eyre;
  use reqwest::header::{HeaderMap, CONTENT_TYPE};
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  const ORIGIN: &str = "http://localhost:8000";
  const CURRENT: &str = "v2-current";

  /// Scripted network with a call counter.
  #[derive(Default)]
  struct FakeNetwork {
    calls: AtomicUsize,
    offline: bool,
    hang: bool,
    routes: Mutex<HashMap<String, ProxyResponse>>,
  }

  impl FakeNetwork {
    fn online() -> Self {
      Self::default()
    }

    fn offline() -> Self {
      Self {
        offline: true,
        ..Self::default()
      }
    }

    fn route(self, path: &str, response: ProxyResponse) -> Self {
      self.routes.lock().unwrap().insert(path.to_string(), response);
      self
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.hang {
        futures::future::pending::<()>().await;
      }
      if self.offline {
        return Err(ProxyError::network(request.url.as_str(), "offline"));
      }
      let routed = self.routes.lock().unwrap().get(request.url.path()).cloned();
      Ok(routed.unwrap_or_else(|| ProxyResponse::text(StatusCode::NOT_FOUND, "not found")))
    }
  }

  /// Reads succeed, writes always fail.
  struct ReadOnlyStore(SqliteStore);

  impl VersionedStore for ReadOnlyStore {
    fn open(&self, name: &str) -> color_eyre::Result<()> {
      self.0.open(name)
    }
    fn names(&self) -> color_eyre::Result<Vec<String>> {
      self.0.names()
    }
    fn delete(&self, name: &str) -> color_eyre::Result<bool> {
      self.0.delete(name)
    }
    fn put(&self, _name: &str, _entry: &CachedEntry) -> color_eyre::Result<()> {
      Err(eyre!("disk full"))
    }
    fn get(
      &self,
      name: &str,
      identity: &RequestIdentity,
    ) -> color_eyre::Result<Option<CachedEntry>> {
      self.0.get(name, identity)
    }
    fn match_any(&self, identity: &RequestIdentity) -> color_eyre::Result<Option<CacheMatch>> {
      self.0.match_any(identity)
    }
  }

  /// Every lookup errors; writes go through.
  struct BrokenIndexStore(SqliteStore);

  impl VersionedStore for BrokenIndexStore {
    fn open(&self, name: &str) -> color_eyre::Result<()> {
      self.0.open(name)
    }
    fn names(&self) -> color_eyre::Result<Vec<String>> {
      self.0.names()
    }
    fn delete(&self, name: &str) -> color_eyre::Result<bool> {
      self.0.delete(name)
    }
    fn put(&self, name: &str, entry: &CachedEntry) -> color_eyre::Result<()> {
      self.0.put(name, entry)
    }
    fn get(
      &self,
      _name: &str,
      _identity: &RequestIdentity,
    ) -> color_eyre::Result<Option<CachedEntry>> {
      Err(eyre!("database disk image is malformed"))
    }
    fn match_any(&self, _identity: &RequestIdentity) -> color_eyre::Result<Option<CacheMatch>> {
      Err(eyre!("database disk image is malformed"))
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn asset(body: &'static str, content_type: &'static str) -> ProxyResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, content_type.parse().unwrap());
    ProxyResponse {
      status: StatusCode::OK,
      headers,
      body: Bytes::from_static(body.as_bytes()),
      url: None,
      kind: ResponseKind::Basic,
      redirected: false,
    }
  }

  fn coordinator<S: VersionedStore + 'static>(
    store: Arc<S>,
    network: Arc<FakeNetwork>,
  ) -> FetchCoordinator<S, FakeNetwork> {
    let exts = ["css", "js", "png"].iter().map(|s| s.to_string()).collect();
    let policy = InterceptionPolicy::new(Url::parse(ORIGIN).unwrap(), exts);
    FetchCoordinator::new(
      store,
      network,
      policy,
      CURRENT.to_string(),
      &url("/offline/"),
      Arc::new(ProxyStats::new()),
    )
  }

  fn seed(store: &SqliteStore, name: &str, path: &str, body: &'static str) {
    let entry = CachedEntry::from_response(
      RequestIdentity::get(&url(path)),
      &asset(body, "text/html"),
    );
    store.put(name, &entry).unwrap();
  }

  fn navigate(path: &str) -> ProxyRequest {
    ProxyRequest::get(url(path)).with_mode(RequestMode::Navigate)
  }

  #[tokio::test]
  async fn test_hit_serves_cached_bytes_without_network() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed(&store, CURRENT, "/static/app.css", "body { margin: 0 }");
    let network = Arc::new(FakeNetwork::online());
    let c = coordinator(store, network.clone());

    let ctx = EventContext::detached();
    let outcome = c.handle(&ctx, ProxyRequest::get(url("/static/app.css"))).await;
    ctx.settle().await;

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(&outcome.response.body[..], b"body { margin: 0 }");
    assert_eq!(outcome.response.headers[CONTENT_TYPE], "text/html");
    assert!(outcome.cached_at.is_some());
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_stale_store_entry_is_still_served() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed(&store, "v1", "/static/app.js", "old();");
    let network = Arc::new(FakeNetwork::online());
    let c = coordinator(store, network.clone());

    let outcome = c
      .handle(&EventContext::detached(), ProxyRequest::get(url("/static/app.js")))
      .await;

    assert_eq!(outcome.source, ResponseSource::Cache);
    assert_eq!(&outcome.response.body[..], b"old();");
    assert_eq!(network.calls(), 0);
    assert_eq!(c.stats.snapshot().stale_hits, 1);
  }

  #[tokio::test]
  async fn test_static_asset_is_written_back() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = Arc::new(
      FakeNetwork::online().route("/static/app.css", asset("h1 { }", "text/css")),
    );
    let c = coordinator(store.clone(), network.clone());

    let ctx = EventContext::detached();
    let first = c.handle(&ctx, ProxyRequest::get(url("/static/app.css"))).await;
    ctx.settle().await;
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(network.calls(), 1);

    let stored = store
      .get(CURRENT, &RequestIdentity::get(&url("/static/app.css")))
      .unwrap();
    assert!(stored.is_some());

    let second = c
      .handle(&EventContext::detached(), ProxyRequest::get(url("/static/app.css")))
      .await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.body, first.response.body);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_data_response_is_not_written_back() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = Arc::new(
      FakeNetwork::online().route("/api/orders.json", asset("[]", "application/json")),
    );
    let c = coordinator(store.clone(), network.clone());

    for _ in 0..2 {
      let ctx = EventContext::detached();
      let outcome = c.handle(&ctx, ProxyRequest::get(url("/api/orders.json"))).await;
      ctx.settle().await;
      assert_eq!(outcome.source, ResponseSource::Network);
      assert_eq!(&outcome.response.body[..], b"[]");
    }

    assert_eq!(network.calls(), 2);
    assert!(store.names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_invalid_responses_are_returned_but_not_stored() {
    let mut redirected = asset("a {}", "text/css");
    redirected.redirected = true;
    let mut opaque = asset("b {}", "text/css");
    opaque.kind = ResponseKind::Opaque;

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = Arc::new(
      FakeNetwork::online()
        .route("/moved.css", redirected)
        .route("/opaque.css", opaque),
    );
    let c = coordinator(store.clone(), network.clone());

    for path in ["/moved.css", "/opaque.css", "/missing.css"] {
      let ctx = EventContext::detached();
      let outcome = c.handle(&ctx, ProxyRequest::get(url(path))).await;
      ctx.settle().await;
      assert_eq!(outcome.source, ResponseSource::Network);
    }

    let missing = c
      .handle(&EventContext::detached(), ProxyRequest::get(url("/missing.css")))
      .await;
    assert_eq!(missing.response.status, StatusCode::NOT_FOUND);
    assert!(store.names().unwrap().is_empty());
    assert_eq!(network.calls(), 4);
  }

  #[tokio::test]
  async fn test_write_back_failure_still_returns_response() {
    let store = Arc::new(ReadOnlyStore(SqliteStore::open_in_memory().unwrap()));
    let network = Arc::new(FakeNetwork::online().route("/logo.png", asset("PNG", "image/png")));
    let c = coordinator(store, network);

    let ctx = EventContext::detached();
    let outcome = c.handle(&ctx, ProxyRequest::get(url("/logo.png"))).await;
    ctx.settle().await;

    assert_eq!(outcome.source, ResponseSource::Network);
    assert_eq!(&outcome.response.body[..], b"PNG");
    let snapshot = c.stats.snapshot();
    assert_eq!(snapshot.write_backs, 0);
    assert_eq!(snapshot.write_back_failures, 1);
  }

  #[tokio::test]
  async fn test_navigation_failure_serves_offline_page() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed(&store, CURRENT, "/offline/", "<h1>You are offline</h1>");
    let c = coordinator(store, Arc::new(FakeNetwork::offline()));

    let outcome = c.handle(&EventContext::detached(), navigate("/orders/")).await;

    assert_eq!(outcome.source, ResponseSource::OfflinePage);
    assert_eq!(&outcome.response.body[..], b"<h1>You are offline</h1>");
  }

  #[tokio::test]
  async fn test_sub_resource_failure_is_408() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed(&store, CURRENT, "/offline/", "<h1>You are offline</h1>");
    let c = coordinator(store, Arc::new(FakeNetwork::offline()));

    let outcome = c
      .handle(&EventContext::detached(), ProxyRequest::get(url("/api/orders.json")))
      .await;

    assert_eq!(outcome.source, ResponseSource::NetworkError);
    assert_eq!(outcome.response.status.as_u16(), 408);
    assert_eq!(&outcome.response.body[..], NETWORK_ERROR_BODY.as_bytes());
    assert_eq!(outcome.response.headers[CONTENT_TYPE], "text/plain");
  }

  #[tokio::test]
  async fn test_lookup_error_falls_through_to_network() {
    let network = Arc::new(
      FakeNetwork::online().route("/static/app.css", asset("body {}", "text/css")),
    );
    let c = coordinator(
      Arc::new(BrokenIndexStore(SqliteStore::open_in_memory().unwrap())),
      network.clone(),
    );

    let outcome = c
      .handle(&EventContext::detached(), ProxyRequest::get(url("/static/app.css")))
      .await;
    assert_eq!(outcome.source, ResponseSource::Network);
    assert_eq!(&outcome.response.body[..], b"body {}");
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_lookup_error_while_offline_is_408() {
    let c = coordinator(
      Arc::new(BrokenIndexStore(SqliteStore::open_in_memory().unwrap())),
      Arc::new(FakeNetwork::offline()),
    );

    let outcome = c
      .handle(&EventContext::detached(), ProxyRequest::get(url("/static/app.css")))
      .await;
    assert_eq!(outcome.source, ResponseSource::NetworkError);
    assert_eq!(outcome.response.status.as_u16(), 408);
  }

  #[tokio::test]
  async fn test_missing_offline_page_is_visible() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let c = coordinator(store, Arc::new(FakeNetwork::offline()));

    let outcome = c.handle(&EventContext::detached(), navigate("/")).await;

    assert_eq!(outcome.source, ResponseSource::FallbackUnavailable);
    assert_eq!(outcome.response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(c.stats.snapshot().fallback_unavailable, 1);
  }

  #[tokio::test]
  async fn test_cancellation_takes_fallback_branch() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let network = Arc::new(FakeNetwork {
      hang: true,
      ..FakeNetwork::default()
    });
    let c = coordinator(store, network);

    let ctx = EventContext::detached().with_deadline(Duration::from_millis(20));
    let outcome = c.handle(&ctx, ProxyRequest::get(url("/static/slow.js"))).await;
    assert_eq!(outcome.source, ResponseSource::NetworkError);

    let ctx = EventContext::detached();
    ctx.token().cancel();
    let outcome = c.handle(&ctx, navigate("/slow/")).await;
    assert_eq!(outcome.source, ResponseSource::FallbackUnavailable);
  }
}

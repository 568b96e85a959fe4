use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{
  FetchOutcome, Ready, ResponseSource, SqliteStore, StoreLifecycleManager, VersionedStore,
};
use crate::config::Config;
use crate::error::ProxyError;
use crate::event::{EventContext, LifecycleHandler};
use crate::proxy::{
  FetchCoordinator, Fetcher, Interception, InterceptionPolicy, ProxyRequest, ProxyResponse,
  ProxyStats, StatsSnapshot, UpstreamFetcher,
};
use crate::server::ProxyServer;
use crate::sync::{DeferredWorkQueue, LoggingSyncHandler, SyncHandler};

/// Everything a single proxy process owns, wired from one configuration.
pub struct OfflineProxy<S: VersionedStore, F: Fetcher> {
  config: Config,
  store: Arc<S>,
  fetcher: Arc<F>,
  policy: InterceptionPolicy,
  lifecycle: StoreLifecycleManager<S>,
  coordinator: FetchCoordinator<S, F>,
  queue: DeferredWorkQueue,
  stats: Arc<ProxyStats>,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Serialize)]
pub struct StatusReport {
  pub version: String,
  pub stores: Vec<String>,
  pub controlling: bool,
  pub pending_sync: Vec<String>,
  pub stats: StatsSnapshot,
}

impl<S, F> OfflineProxy<S, F>
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  pub fn new(config: Config, store: S, fetcher: F, sync: Arc<dyn SyncHandler>) -> Result<Self> {
    let origin = config.origin_url()?;
    let offline_page = origin.join(&config.store.offline_path)?;
    let store = Arc::new(store);
    let fetcher = Arc::new(fetcher);
    let stats = Arc::new(ProxyStats::new());
    let policy = InterceptionPolicy::new(origin, config.store.cacheable_extensions.clone());

    let lifecycle = StoreLifecycleManager::new(store.clone(), &config)?;
    let coordinator = FetchCoordinator::new(
      store.clone(),
      fetcher.clone(),
      policy.clone(),
      config.store.version.clone(),
      &offline_page,
      stats.clone(),
    );

    Ok(Self {
      config,
      store,
      fetcher,
      policy,
      lifecycle,
      coordinator,
      queue: DeferredWorkQueue::new(sync),
      stats,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn origin(&self) -> &Url {
    self.policy.origin()
  }

  pub fn is_controlling(&self) -> bool {
    self.lifecycle.is_controlling()
  }

  /// Run the install and activate edges in order.
  ///
  /// A failed install is logged and left for the next startup. Activation is
  /// skipped so older generations survive; control is still claimed and
  /// requests are served from whatever the stores hold.
  pub async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
    let ctx = EventContext::new(shutdown.child_token());
    let installed = self.on_install(&ctx).await;
    ctx.settle().await;

    match installed {
      Ok(ready) => info!(
        "Store {} ready with {} entries",
        ready.version, ready.entries
      ),
      Err(e) => {
        error!("Install incomplete, will retry on next startup: {}", e);
        warn!("Keeping stores {:?} until an install succeeds", self.store.names()?);
        self.lifecycle.claim();
        return Ok(());
      }
    }

    let ctx = EventContext::new(shutdown.child_token());
    let pruned = self.on_activate(&ctx).await?;
    if !pruned.is_empty() {
      info!("Pruned stale stores: {}", pruned.join(", "));
    }
    ctx.settle().await;

    Ok(())
  }

  /// Forward a request without any cache involvement.
  pub async fn passthrough(&self, request: ProxyRequest) -> FetchOutcome {
    let url = request.url.clone();
    match self.fetcher.fetch(request).await {
      Ok(response) => FetchOutcome::degraded(response, ResponseSource::Bypass),
      Err(e) => {
        warn!("bypassed request to {} failed: {}", url, e);
        FetchOutcome::degraded(
          ProxyResponse::text(StatusCode::BAD_GATEWAY, "Upstream unreachable"),
          ResponseSource::Bypass,
        )
      }
    }
  }

  /// Whether `tag` is one the sync handler drains.
  pub fn accepts_sync_tag(&self, tag: &str) -> bool {
    self.config.sync.tags.iter().any(|t| t == tag)
  }

  /// Queue deferred work. Tags nothing would ever drain are refused.
  pub fn submit_sync(&self, tag: &str) -> Result<()> {
    if !self.accepts_sync_tag(tag) {
      return Err(eyre!("Unknown sync tag {}", tag));
    }
    self.queue.submit(tag)
  }

  pub fn pending_sync(&self) -> Vec<String> {
    self.queue.pending_tags()
  }

  pub async fn is_online(&self) -> bool {
    self.fetcher.is_online().await
  }

  pub fn status(&self) -> Result<StatusReport> {
    Ok(StatusReport {
      version: self.lifecycle.version().to_string(),
      stores: self.store.names()?,
      controlling: self.lifecycle.is_controlling(),
      pending_sync: self.queue.pending_tags(),
      stats: self.stats.snapshot(),
    })
  }
}

#[async_trait]
impl<S, F> LifecycleHandler for OfflineProxy<S, F>
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  async fn on_install(&self, ctx: &EventContext) -> Result<Ready, ProxyError> {
    info!("Proxy installing.");
    let ready = self
      .lifecycle
      .ensure_current_store(self.fetcher.as_ref(), ctx)
      .await?;
    debug!("Install complete, skipping wait for older instances");
    Ok(ready)
  }

  async fn on_activate(&self, _ctx: &EventContext) -> Result<Vec<String>> {
    info!("Proxy activating.");
    let pruned = self.lifecycle.prune_stale_stores()?;
    self.lifecycle.claim();
    Ok(pruned)
  }

  async fn on_fetch(&self, ctx: &EventContext, request: ProxyRequest) -> Option<FetchOutcome> {
    if !self.lifecycle.is_controlling() {
      self.stats.record_bypass();
      return None;
    }

    match self.policy.classify(&request) {
      Interception::Bypass => {
        self.stats.record_bypass();
        None
      }
      Interception::Intercept => Some(self.coordinator.handle(ctx, request).await),
    }
  }

  async fn on_sync(&self, _ctx: &EventContext, tag: &str) -> Result<()> {
    if !self.accepts_sync_tag(tag) {
      debug!("Ignoring sync for unknown tag {}", tag);
      return Ok(());
    }

    info!("Background sync triggered for {}", tag);
    self.queue.drain(tag).await?;
    Ok(())
  }
}

/// Periodically drain deferred work while the upstream is reachable.
pub async fn sync_loop<S, F>(proxy: Arc<OfflineProxy<S, F>>, shutdown: CancellationToken)
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  let mut ticker = tokio::time::interval(proxy.config().sync_interval());

  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = ticker.tick() => {}
    }

    let tags = proxy.pending_sync();
    if tags.is_empty() {
      continue;
    }
    if !proxy.is_online().await {
      debug!(
        "Upstream unreachable, {} deferred items stay queued",
        proxy.queue.len()
      );
      continue;
    }

    for tag in tags {
      let ctx = EventContext::new(shutdown.child_token());
      if let Err(e) = proxy.on_sync(&ctx, &tag).await {
        warn!("Sync for {} failed: {}", tag, e);
      }
      ctx.settle().await;
    }
  }
}

/// Open the stores, run the lifecycle edges and serve until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
  let store = SqliteStore::open(&config.database_path()?)?;
  let fetcher = UpstreamFetcher::new(&config)?;
  let listen = config.listen.clone();
  let proxy = Arc::new(OfflineProxy::new(
    config,
    store,
    fetcher,
    Arc::new(LoggingSyncHandler),
  )?);

  let shutdown = CancellationToken::new();
  proxy.start(&shutdown).await?;

  let sync_task = tokio::spawn(sync_loop(proxy.clone(), shutdown.child_token()));
  let server = ProxyServer::start(&listen, proxy.clone(), shutdown.clone()).await?;
  info!(
    "Proxying {} on http://{}",
    proxy.origin(),
    server.local_addr()
  );

  tokio::signal::ctrl_c().await?;
  info!("Shutting down");
  shutdown.cancel();
  server.wait().await;
  sync_task.await.ok();

  Ok(())
}

//! HTTP front end: turns client traffic into lifecycle events.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
  body::{to_bytes, Body},
  extract::{Path, Request, State},
  http::{HeaderName, HeaderValue, StatusCode, Uri},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use url::Url;

use crate::app::OfflineProxy;
use crate::cache::{FetchOutcome, VersionedStore};
use crate::event::{EventContext, LifecycleHandler};
use crate::proxy::{Fetcher, ProxyRequest};

const SOURCE_HEADER: &str = "x-offline-proxy-source";

struct ServerState<S: VersionedStore, F: Fetcher> {
  proxy: Arc<OfflineProxy<S, F>>,
  shutdown: CancellationToken,
  /// Event contexts still settling after their response went out
  contexts: TaskTracker,
}

impl<S: VersionedStore, F: Fetcher> Clone for ServerState<S, F> {
  fn clone(&self) -> Self {
    Self {
      proxy: Arc::clone(&self.proxy),
      shutdown: self.shutdown.clone(),
      contexts: self.contexts.clone(),
    }
  }
}

pub struct ProxyServer {
  addr: SocketAddr,
  handle: JoinHandle<()>,
  contexts: TaskTracker,
}

impl ProxyServer {
  /// Bind `listen` and serve until `shutdown` is cancelled.
  pub async fn start<S, F>(
    listen: &str,
    proxy: Arc<OfflineProxy<S, F>>,
    shutdown: CancellationToken,
  ) -> Result<Self>
  where
    S: VersionedStore + 'static,
    F: Fetcher + 'static,
  {
    let listener = TcpListener::bind(listen)
      .await
      .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
    let addr = listener.local_addr()?;

    let contexts = TaskTracker::new();
    let state = ServerState {
      proxy,
      shutdown: shutdown.clone(),
      contexts: contexts.clone(),
    };

    let app = Router::new()
      .route("/__offline/status", get(status_handler::<S, F>))
      .route("/__offline/sync/{tag}", post(submit_sync_handler::<S, F>))
      .route("/__offline/sync/{tag}/drain", post(drain_sync_handler::<S, F>))
      .fallback(proxy_handler::<S, F>)
      .with_state(state);

    let handle = tokio::spawn(async move {
      if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
      {
        error!("server error: {}", e);
      }
    });

    Ok(Self {
      addr,
      handle,
      contexts,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  /// Wait for the server to stop and every open event to settle.
  pub async fn wait(self) {
    self.handle.await.ok();
    self.contexts.close();
    self.contexts.wait().await;
  }
}

/// Absolute-form URIs (forward proxy) are taken as-is; origin-form paths are
/// resolved against the configured origin.
fn resolve_url(uri: &Uri, origin: &Url) -> Option<Url> {
  if uri.scheme().is_some() && uri.authority().is_some() {
    return Url::parse(&uri.to_string()).ok();
  }

  let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  origin.join(path).ok()
}

fn to_http_response(outcome: FetchOutcome) -> Response {
  let FetchOutcome {
    response, source, ..
  } = outcome;

  let mut res = Response::new(Body::from(response.body));
  *res.status_mut() = response.status;
  *res.headers_mut() = response.headers;
  res.headers_mut().insert(
    HeaderName::from_static(SOURCE_HEADER),
    HeaderValue::from_static(source.as_str()),
  );
  res
}

/// Any method, any path: the intercepted traffic.
async fn proxy_handler<S, F>(State(state): State<ServerState<S, F>>, req: Request) -> Response
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  let max_body = state.proxy.config().max_body_bytes;
  let (parts, body) = req.into_parts();

  let body = match to_bytes(body, max_body).await {
    Ok(b) => b,
    Err(e) => {
      warn!("rejecting request body for {}: {}", parts.uri, e);
      return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
    }
  };

  let url = match resolve_url(&parts.uri, state.proxy.origin()) {
    Some(url) => url,
    None => return (StatusCode::BAD_REQUEST, "unresolvable request URI").into_response(),
  };

  if !state.proxy.config().forward_proxy && url.origin() != state.proxy.origin().origin() {
    debug!("refusing forward request to {}", url);
    return (StatusCode::FORBIDDEN, "forward proxying is disabled").into_response();
  }

  let request = ProxyRequest::new(parts.method, url, parts.headers, body);
  let ctx = EventContext::new(state.shutdown.child_token())
    .with_deadline(state.proxy.config().fetch_timeout());

  let outcome = match state.proxy.on_fetch(&ctx, request.clone()).await {
    Some(outcome) => outcome,
    None => state.proxy.passthrough(request).await,
  };

  debug!(
    "{} -> {} ({})",
    outcome.response.url.as_ref().map(Url::as_str).unwrap_or("-"),
    outcome.response.status,
    outcome.source.as_str()
  );

  state.contexts.spawn(ctx.settle());
  to_http_response(outcome)
}

async fn status_handler<S, F>(State(state): State<ServerState<S, F>>) -> Response
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  match state.proxy.status() {
    Ok(report) => Json(report).into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {}", e)).into_response(),
  }
}

/// POST /__offline/sync/{tag}: queue deferred work.
async fn submit_sync_handler<S, F>(
  State(state): State<ServerState<S, F>>,
  Path(tag): Path<String>,
) -> Response
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  if !state.proxy.accepts_sync_tag(&tag) {
    return (StatusCode::NOT_FOUND, format!("unknown sync tag {}", tag)).into_response();
  }

  match state.proxy.submit_sync(&tag) {
    Ok(()) => StatusCode::ACCEPTED.into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {}", e)).into_response(),
  }
}

/// POST /__offline/sync/{tag}/drain: the host says the tag is due now.
async fn drain_sync_handler<S, F>(
  State(state): State<ServerState<S, F>>,
  Path(tag): Path<String>,
) -> Response
where
  S: VersionedStore + 'static,
  F: Fetcher + 'static,
{
  let ctx = EventContext::new(state.shutdown.child_token());
  let result = state.proxy.on_sync(&ctx, &tag).await;
  ctx.settle().await;

  match result {
    Ok(()) => StatusCode::NO_CONTENT.into_response(),
    Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("error: {}", e)).into_response(),
  }
}

//! Network access behind a trait so the coordinator can be driven by fakes.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::request::ProxyRequest;
use super::response::{ProxyResponse, ResponseKind};
use crate::config::Config;
use crate::error::ProxyError;

#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Issue the request. Any failure to obtain a response is a network failure;
  /// HTTP error statuses are responses.
  async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError>;

  /// Cheap connectivity probe used to decide when deferred work may drain.
  async fn is_online(&self) -> bool {
    true
  }
}

/// Connection-level headers that must not be forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

fn strip_headers(headers: &HeaderMap, extra: &[&str]) -> HeaderMap {
  let mut out = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    let n = name.as_str();
    if HOP_BY_HOP.contains(&n) || extra.contains(&n) {
      continue;
    }
    out.append(name.clone(), value.clone());
  }
  out
}

/// Fetches from the real network with `reqwest`.
#[derive(Clone)]
pub struct UpstreamFetcher {
  client: Client,
  origin: Url,
}

impl UpstreamFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let client = Client::builder()
      .timeout(config.fetch_timeout())
      .no_proxy()
      .user_agent(concat!("offline-proxy/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: config.origin_url()?,
    })
  }

  fn classify(&self, requested: &Url, final_url: &Url) -> (ResponseKind, bool) {
    let kind = if final_url.origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Opaque
    };

    let mut requested = requested.clone();
    requested.set_fragment(None);
    (kind, requested != *final_url)
  }
}

#[async_trait]
impl Fetcher for UpstreamFetcher {
  async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
    let url = request.url.clone();
    // Host is derived from the URL; reqwest negotiates encoding and length itself.
    let headers = strip_headers(
      &request.headers,
      &["host", "content-length", "accept-encoding"],
    );

    let mut builder = self
      .client
      .request(request.method.clone(), url.clone())
      .headers(headers);
    if !request.body.is_empty() {
      builder = builder.body(request.body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ProxyError::network(url.as_str(), e))?;

    let status = response.status();
    let final_url = response.url().clone();
    let headers = strip_headers(response.headers(), &["content-length"]);
    let (kind, redirected) = self.classify(&url, &final_url);

    let body = response
      .bytes()
      .await
      .map_err(|e| ProxyError::network(url.as_str(), e))?;

    debug!(
      "fetched {} {} -> {} ({} bytes, redirected={})",
      request.method,
      url,
      status,
      body.len(),
      redirected
    );

    Ok(ProxyResponse {
      status,
      headers,
      body,
      url: Some(final_url),
      kind,
      redirected,
    })
  }

  async fn is_online(&self) -> bool {
    self
      .client
      .request(Method::HEAD, self.origin.clone())
      .timeout(Duration::from_secs(5))
      .send()
      .await
      .is_ok()
  }
}

//! Core types for the versioned stores.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use url::Url;

use crate::proxy::{ProxyResponse, RequestIdentity, ResponseKind};

/// An immutable snapshot of a response, owned by exactly one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
  pub identity: RequestIdentity,
  pub status: u16,
  /// Header pairs in wire order; values that are not valid UTF-8 are dropped
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Snapshot a response under `identity`.
  pub fn from_response(identity: RequestIdentity, response: &ProxyResponse) -> Self {
    let headers = response
      .headers
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    Self {
      identity,
      status: response.status.as_u16(),
      headers,
      body: response.body.clone(),
      cached_at: Utc::now(),
    }
  }

  /// Rebuild a servable response from the snapshot.
  pub fn to_response(&self) -> ProxyResponse {
    let mut headers = HeaderMap::with_capacity(self.headers.len());
    for (name, value) in &self.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }

    ProxyResponse {
      status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
      headers,
      body: self.body.clone(),
      url: Url::parse(&self.identity.url).ok(),
      kind: ResponseKind::Basic,
      redirected: false,
    }
  }
}

/// A lookup hit together with the store that held it.
#[derive(Debug, Clone)]
pub struct CacheMatch {
  pub store: String,
  pub entry: CachedEntry,
}

/// Where a response handed to the client came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Served from a store without touching the network
  Cache,
  /// Fresh from the network (possibly written back)
  Network,
  /// Network failed on a navigation; offline page served
  OfflinePage,
  /// Network failed on a sub-resource; synthetic 408 served
  NetworkError,
  /// Network failed and the offline page is missing
  FallbackUnavailable,
  /// Not intercepted, forwarded as-is
  Bypass,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::Network => "network",
      Self::OfflinePage => "offline-page",
      Self::NetworkError => "network-error",
      Self::FallbackUnavailable => "fallback-unavailable",
      Self::Bypass => "bypass",
    }
  }
}

/// Result of handling one request, including metadata about the source.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub response: ProxyResponse,
  pub source: ResponseSource,
  /// When the served entry was stored (cache and offline-page sources)
  pub cached_at: Option<DateTime<Utc>>,
}

impl FetchOutcome {
  pub fn from_network(response: ProxyResponse) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(hit: &CacheMatch) -> Self {
    Self {
      response: hit.entry.to_response(),
      source: ResponseSource::Cache,
      cached_at: Some(hit.entry.cached_at),
    }
  }

  pub fn offline_page(hit: &CacheMatch) -> Self {
    Self {
      source: ResponseSource::OfflinePage,
      ..Self::from_cache(hit)
    }
  }

  pub fn degraded(response: ProxyResponse, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      cached_at: None,
    }
  }
}

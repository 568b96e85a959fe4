//! Intercepted requests and the identity they are cached under.

use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// What the client is loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  /// Anything else: stylesheets, scripts, XHR, images
  SubResource,
}

/// A request as seen by the proxy, before it touches the network.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Bytes,
  pub mode: RequestMode,
}

impl ProxyRequest {
  /// Build a request, inferring navigation intent from its headers.
  pub fn new(method: Method, url: Url, headers: HeaderMap, body: Bytes) -> Self {
    let mode = detect_mode(&method, &headers);
    Self {
      method,
      url,
      headers,
      body,
      mode,
    }
  }

  /// A bare sub-resource GET, as issued for manifest population.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: HeaderMap::new(),
      body: Bytes::new(),
      mode: RequestMode::SubResource,
    }
  }

  #[cfg(test)]
  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(&self.method, &self.url)
  }
}

/// Navigation detection.
///
/// Browsers send `Sec-Fetch-Mode: navigate` for document loads. Clients that
/// predate fetch metadata are treated as navigating when a GET asks for HTML.
pub fn detect_mode(method: &Method, headers: &HeaderMap) -> RequestMode {
  if let Some(mode) = headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok()) {
    return if mode.eq_ignore_ascii_case("navigate") {
      RequestMode::Navigate
    } else {
      RequestMode::SubResource
    };
  }

  let wants_html = headers
    .get(ACCEPT)
    .and_then(|v| v.to_str().ok())
    .map(|accept| accept.contains("text/html"))
    .unwrap_or(false);

  if *method == Method::GET && wants_html {
    RequestMode::Navigate
  } else {
    RequestMode::SubResource
  }
}

/// Method plus absolute URL (fragment dropped).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  pub method: String,
  pub url: String,
}

impl RequestIdentity {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.into(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(&Method::GET, url)
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

//! Responses flowing back to the client.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use url::Url;

/// How much of the response the proxy may inspect and re-serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  /// Same-origin response with readable status and body
  Basic,
  /// Cross-origin response; never persisted
  Opaque,
  /// Produced locally (fallbacks)
  Synthetic,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
  /// Final URL after redirects, if the response came from the network or a store
  pub url: Option<Url>,
  pub kind: ResponseKind,
  pub redirected: bool,
}

impl ProxyResponse {
  /// A locally generated plain-text response.
  pub fn text(status: StatusCode, body: &'static str) -> Self {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    Self {
      status,
      headers,
      body: Bytes::from_static(body.as_bytes()),
      url: None,
      kind: ResponseKind::Synthetic,
      redirected: false,
    }
  }

  /// Validity gate for write-back: exactly 200, same-origin, not redirected.
  pub fn is_storable(&self) -> bool {
    self.status == StatusCode::OK && self.kind == ResponseKind::Basic && !self.redirected
  }
}

//! Which requests the proxy touches, and which responses it keeps.

use reqwest::Method;
use std::collections::BTreeSet;
use url::Url;

use super::request::ProxyRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
  /// Straight to the network, no cache involvement
  Bypass,
  /// Handled by the fetch coordinator
  Intercept,
}

#[derive(Debug, Clone)]
pub struct InterceptionPolicy {
  origin: Url,
  extensions: BTreeSet<String>,
}

impl InterceptionPolicy {
  pub fn new(origin: Url, extensions: BTreeSet<String>) -> Self {
    Self { origin, extensions }
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Non-GET and cross-origin requests are never cached nor served from cache.
  pub fn classify(&self, request: &ProxyRequest) -> Interception {
    if request.method != Method::GET || !self.is_same_origin(&request.url) {
      Interception::Bypass
    } else {
      Interception::Intercept
    }
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin()
  }

  /// Extension gate: the path (not the query) ends in a static-asset suffix.
  pub fn is_cacheable_asset(&self, url: &Url) -> bool {
    let last = url.path().rsplit('/').next().unwrap_or("");
    last
      .rsplit_once('.')
      .map(|(_, ext)| self.extensions.contains(&ext.to_ascii_lowercase()))
      .unwrap_or(false)
  }
}

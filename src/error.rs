//! Domain error taxonomy for the proxy core.
//!
//! Plumbing (config, storage, server startup) reports through `color_eyre`.
//! These variants are the conditions the proxy itself reasons about.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
  /// Manifest pre-fetch did not complete at install time.
  #[error("manifest population failed at {url}: {reason}")]
  PopulationFailed { url: String, reason: String },

  /// Store write failed after a successful fetch.
  #[error("write-back failed for {url}: {reason}")]
  WriteBackFailed { url: String, reason: String },

  /// Fetch rejected, timed out or was cancelled.
  #[error("network failure for {url}: {reason}")]
  NetworkFailure { url: String, reason: String },

  /// The offline page itself is missing from every store.
  #[error("offline fallback {path} is not in any store")]
  FallbackUnavailable { path: String },
}

impl ProxyError {
  pub fn network(url: impl Into<String>, reason: impl ToString) -> Self {
    Self::NetworkFailure {
      url: url.into(),
      reason: reason.to_string(),
    }
  }
}

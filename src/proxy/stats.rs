//! Request counters, exposed through the status endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProxyStats {
  hits: AtomicU64,
  stale_hits: AtomicU64,
  misses: AtomicU64,
  write_backs: AtomicU64,
  write_back_failures: AtomicU64,
  offline_pages: AtomicU64,
  network_errors: AtomicU64,
  fallback_unavailable: AtomicU64,
  bypassed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
  pub hits: u64,
  /// Hits served from a store that is not the current generation
  pub stale_hits: u64,
  pub misses: u64,
  pub write_backs: u64,
  pub write_back_failures: u64,
  pub offline_pages: u64,
  pub network_errors: u64,
  pub fallback_unavailable: u64,
  pub bypassed: u64,
}

impl ProxyStats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hit(&self, stale: bool) {
    self.hits.fetch_add(1, Ordering::Relaxed);
    if stale {
      self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn record_miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_write_back(&self) {
    self.write_backs.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_write_back_failure(&self) {
    self.write_back_failures.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_offline_page(&self) {
    self.offline_pages.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_network_error(&self) {
    self.network_errors.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_fallback_unavailable(&self) {
    self.fallback_unavailable.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_bypass(&self) {
    self.bypassed.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      hits: self.hits.load(Ordering::Relaxed),
      stale_hits: self.stale_hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      write_backs: self.write_backs.load(Ordering::Relaxed),
      write_back_failures: self.write_back_failures.load(Ordering::Relaxed),
      offline_pages: self.offline_pages.load(Ordering::Relaxed),
      network_errors: self.network_errors.load(Ordering::Relaxed),
      fallback_unavailable: self.fallback_unavailable.load(Ordering::Relaxed),
      bypassed: self.bypassed.load(Ordering::Relaxed),
    }
  }
}

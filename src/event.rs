//! Lifecycle events delivered by the host and the context each one runs in.

use async_trait::async_trait;
use color_eyre::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::{FetchOutcome, Ready};
use crate::error::ProxyError;
use crate::proxy::ProxyRequest;

/// Per-event context: a cancellation/deadline signal plus a handle that keeps
/// follow-up work alive after the event's result has been produced.
pub struct EventContext {
  token: CancellationToken,
  deadline: Option<Instant>,
  tracker: TaskTracker,
}

impl EventContext {
  pub fn new(token: CancellationToken) -> Self {
    Self {
      token,
      deadline: None,
      tracker: TaskTracker::new(),
    }
  }

  /// A context nobody else can cancel.
  pub fn detached() -> Self {
    Self::new(CancellationToken::new())
  }

  pub fn with_deadline(mut self, timeout: Duration) -> Self {
    self.deadline = Some(Instant::now() + timeout);
    self
  }

  #[cfg(test)]
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
  }

  /// Resolves once the event is cancelled or its deadline passes.
  pub async fn done(&self) {
    match self.deadline {
      Some(deadline) => {
        tokio::select! {
          _ = self.token.cancelled() => {}
          _ = tokio::time::sleep_until(deadline) => {}
        }
      }
      None => self.token.cancelled().await,
    }
  }

  /// Hold the event open until `work` settles.
  pub fn wait_until<F>(&self, work: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    self.tracker.spawn(work);
  }

  /// Wait for everything registered with `wait_until`.
  pub async fn settle(self) {
    self.tracker.close();
    self.tracker.wait().await;
  }
}

/// One method per lifecycle signal, registered once at process start.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
  /// Prepare the current generation's store.
  async fn on_install(&self, ctx: &EventContext) -> Result<Ready, ProxyError>;

  /// Drop stale generations and take control. Returns the pruned store names.
  async fn on_activate(&self, ctx: &EventContext) -> Result<Vec<String>>;

  /// Handle a request. `None` leaves the request to the network untouched.
  async fn on_fetch(&self, ctx: &EventContext, request: ProxyRequest) -> Option<FetchOutcome>;

  /// A named synchronization tag is due.
  async fn on_sync(&self, ctx: &EventContext, tag: &str) -> Result<()>;
}

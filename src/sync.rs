//! Deferred work submitted while offline, drained when the host says a tag is due.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// An opaque named unit of work awaiting reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredWorkItem {
  pub tag: String,
  pub submitted_at: DateTime<Utc>,
}

/// Reconciles one deferred item. Swappable without touching request handling.
#[async_trait]
pub trait SyncHandler: Send + Sync {
  async fn reconcile(&self, item: &DeferredWorkItem) -> Result<()>;
}

/// Default handler: records that a drain happened and nothing else.
pub struct LoggingSyncHandler;

#[async_trait]
impl SyncHandler for LoggingSyncHandler {
  async fn reconcile(&self, item: &DeferredWorkItem) -> Result<()> {
    info!(
      "Performing background sync for {} (submitted {})",
      item.tag, item.submitted_at
    );
    Ok(())
  }
}

/// FIFO queue of deferred work.
pub struct DeferredWorkQueue {
  pending: Mutex<VecDeque<DeferredWorkItem>>,
  handler: Arc<dyn SyncHandler>,
}

impl DeferredWorkQueue {
  pub fn new(handler: Arc<dyn SyncHandler>) -> Self {
    Self {
      pending: Mutex::new(VecDeque::new()),
      handler,
    }
  }

  pub fn submit(&self, tag: &str) -> Result<()> {
    let mut pending = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    pending.push_back(DeferredWorkItem {
      tag: tag.to_string(),
      submitted_at: Utc::now(),
    });
    debug!("queued deferred work {} ({} pending)", tag, pending.len());
    Ok(())
  }

  /// Distinct pending tags in submission order.
  pub fn pending_tags(&self) -> Vec<String> {
    let pending = match self.pending.lock() {
      Ok(p) => p,
      Err(_) => return Vec::new(),
    };
    let mut tags: Vec<String> = Vec::new();
    for item in pending.iter() {
      if !tags.contains(&item.tag) {
        tags.push(item.tag.clone());
      }
    }
    tags
  }

  pub fn len(&self) -> usize {
    self.pending.lock().map(|p| p.len()).unwrap_or(0)
  }

  /// Hand every item with `tag` to the handler, oldest first.
  ///
  /// Items are removed once reconciled. If the handler fails, the failed
  /// item and the ones after it go back to the front of the queue.
  pub async fn drain(&self, tag: &str) -> Result<usize> {
    let mut batch: VecDeque<DeferredWorkItem> = {
      let mut pending = self
        .pending
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      let (matching, rest): (VecDeque<_>, VecDeque<_>) =
        pending.drain(..).partition(|item| item.tag == tag);
      *pending = rest;
      matching
    };

    let mut drained = 0;
    while let Some(item) = batch.pop_front() {
      if let Err(e) = self.handler.reconcile(&item).await {
        batch.push_front(item);
        self.requeue(batch)?;
        return Err(eyre!("Deferred work {} failed after {} items: {}", tag, drained, e));
      }
      drained += 1;
    }

    if drained > 0 {
      info!("Drained {} deferred items for {}", drained, tag);
    }
    Ok(drained)
  }

  fn requeue(&self, batch: VecDeque<DeferredWorkItem>) -> Result<()> {
    let mut pending = self
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    for item in batch.into_iter().rev() {
      pending.push_front(item);
    }
    Ok(())
  }
}

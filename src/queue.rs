//! Writes captured while offline, replayed in order once the network is back.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::http::{Method, Request};
use crate::net::Network;
use crate::store::{PendingAction, QueueStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
  pub sent: usize,
  pub failed: usize,
}

impl FlushReport {
  pub fn attempted(&self) -> usize {
    self.sent + self.failed
  }
}

#[derive(Clone)]
pub struct OfflineQueue {
  store: Arc<dyn QueueStore>,
  paths: Vec<String>,
}

impl OfflineQueue {
  pub fn new(store: Arc<dyn QueueStore>, paths: Vec<String>) -> Self {
    Self { store, paths }
  }

  /// Only writes to the configured paths are worth replaying.
  pub fn should_queue(&self, request: &Request) -> bool {
    request.method != Method::Get
      && request.method != Method::Head
      && self.paths.iter().any(|p| request.path().starts_with(p.as_str()))
  }

  pub async fn enqueue(&self, request: &Request) -> Result<PendingAction> {
    let action = self.store.push_action(request).await?;
    info!(id = action.id, method = %action.method, url = %action.url, "queued offline write");
    Ok(action)
  }

  pub async fn pending(&self) -> Result<Vec<PendingAction>> {
    self.store.pending_actions().await
  }

  /// Replay every pending action in the order it was queued.
  ///
  /// Each action is dropped from the queue after its attempt, whether the
  /// server accepted it or not.
  pub async fn flush(&self, network: &dyn Network) -> Result<FlushReport> {
    let mut report = FlushReport::default();

    for action in self.store.pending_actions().await? {
      match network.fetch(&action.to_request()).await {
        Ok(response) if response.is_success() => {
          info!(id = action.id, url = %action.url, status = response.status, "replayed");
          report.sent += 1;
        }
        Ok(response) => {
          warn!(id = action.id, url = %action.url, status = response.status, "replay rejected");
          report.failed += 1;
        }
        Err(e) => {
          warn!(id = action.id, url = %action.url, error = %e, "replay failed");
          report.failed += 1;
        }
      }
      self.store.remove_action(action.id).await?;
    }

    if report.attempted() > 0 {
      info!(sent = report.sent, failed = report.failed, "offline queue flushed");
    }
    Ok(report)
  }
}

//! Install and activate transitions of a worker generation.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::fmt;
use tracing::{info, warn};

use super::{Worker, WorkerMessage};
use crate::http::{Method, Request};

/// Lifecycle of one worker generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, install not started
  Parsed,
  /// Pre-caching the app shell
  Installing,
  /// Installed, waiting to activate
  Installed,
  /// Deleting stale generations
  Activating,
  /// Active and controlling clients
  Activated,
  /// Failed install, superseded or unregistered
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }

  pub fn can_transition_to(self, next: WorkerState) -> bool {
    use WorkerState::*;
    matches!(
      (self, next),
      (Parsed, Installing)
        | (Installing, Installed)
        | (Installed, Activating)
        | (Activating, Activated)
        | (Parsed | Installing | Installed | Activating | Activated, Redundant)
    )
  }
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What an activation cleaned up and took over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Stale generations that were deleted
  pub deleted: Vec<String>,
  /// Clients that switched to this generation
  pub claimed: usize,
}

impl Worker {
  /// Pre-cache the app shell into this worker's generation.
  ///
  /// Any shell resource that cannot be fetched fails the whole install and
  /// leaves the worker redundant; a half-filled generation is discarded.
  /// A successful install asks to activate without waiting for old clients.
  pub async fn on_install(&self) -> Result<()> {
    self.transition(WorkerState::Installing)?;
    info!(tag = %self.tag, "installing");

    let existed = self
      .ctx
      .cache
      .list_generations()
      .await
      .map(|tags| tags.iter().any(|t| t == &self.tag))
      .unwrap_or(false);

    match self.precache_shell().await {
      Ok(count) => {
        info!(tag = %self.tag, count, "app shell cached");
        self.request_skip_waiting();
        self.transition(WorkerState::Installed)
      }
      Err(e) => {
        warn!(tag = %self.tag, error = %e, "install failed");
        if !existed {
          if let Err(del) = self.ctx.cache.delete_generation(&self.tag).await {
            warn!(tag = %self.tag, error = %del, "failed to discard partial generation");
          }
        }
        self.mark_redundant();
        Err(e)
      }
    }
  }

  async fn precache_shell(&self) -> Result<usize> {
    self.ctx.cache.open(&self.tag).await?;

    let requests = self
      .ctx
      .app_shell
      .iter()
      .map(|target| Request::resolve(Method::Get, &self.ctx.origin, target))
      .collect::<Result<Vec<_>>>()?;

    // All or nothing: nothing is stored until every resource arrived
    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self.ctx.network.fetch(request).await?;
      if !response.is_success() {
        return Err(eyre!(
          "Shell resource {} returned {}",
          request.url,
          response.status
        ));
      }
      Ok((request.cache_key(), response))
    }))
    .await?;

    for (key, response) in &responses {
      self.ctx.cache.put(&self.tag, key, response).await?;
    }

    Ok(responses.len())
  }

  /// Delete every other generation, then take control of all open clients.
  ///
  /// Storage failures while cleaning up are logged and skipped; they never
  /// stop the activation.
  pub async fn on_activate(&self) -> Result<ActivationReport> {
    self.transition(WorkerState::Activating)?;
    info!(tag = %self.tag, "activating");

    let mut report = ActivationReport::default();

    match self.ctx.cache.list_generations().await {
      Ok(tags) => {
        for tag in tags.into_iter().filter(|t| t != &self.tag) {
          match self.ctx.cache.delete_generation(&tag).await {
            Ok(_) => {
              info!(stale = %tag, "deleted stale generation");
              report.deleted.push(tag);
            }
            Err(e) => warn!(stale = %tag, error = %e, "failed to delete stale generation"),
          }
        }
      }
      Err(e) => warn!(error = %e, "failed to list generations"),
    }

    self.transition(WorkerState::Activated)?;

    report.claimed = self.ctx.clients.claim(&self.tag);
    info!(tag = %self.tag, claimed = report.claimed, "activated, clients claimed");

    Ok(report)
  }

  /// Take over a generation installed by an earlier run without refetching
  /// the shell. Fails if the generation holds nothing.
  pub async fn on_resume(&self) -> Result<()> {
    if self.ctx.cache.entry_count(&self.tag).await? == 0 {
      return Err(eyre!("Generation {} is not installed", self.tag));
    }

    for next in [
      WorkerState::Installing,
      WorkerState::Installed,
      WorkerState::Activating,
      WorkerState::Activated,
    ] {
      self.transition(next)?;
    }

    let claimed = self.ctx.clients.claim(&self.tag);
    info!(tag = %self.tag, claimed, "resumed");
    Ok(())
  }

  /// Delete every generation, including our own, and tell every client.
  pub(crate) async fn clear_all_caches(&self) -> Result<(Vec<String>, usize)> {
    let tags = self.ctx.cache.list_generations().await?;
    for tag in &tags {
      self.ctx.cache.delete_generation(tag).await?;
      info!(tag = %tag, "deleted generation");
    }

    let notified = self.ctx.clients.broadcast(&WorkerMessage::CacheCleared);
    info!(count = tags.len(), notified, "all caches cleared");

    Ok((tags, notified))
  }

  pub(crate) fn mark_redundant(&self) {
    if self.transition(WorkerState::Redundant).is_ok() {
      info!(tag = %self.tag, "worker is redundant");
    }
  }
}

//! One worker generation: the explicit state machine behind the
//! install/activate/fetch/message/push events.
//!
//! The host runtime owns the registration and calls the named transition
//! methods (`on_install`, `on_activate`, `on_fetch`, `on_message`,
//! `on_push`). Everything a handler needs comes in through
//! [`WorkerContext`], so tests can inject a fake network and store.

mod fetch;
mod lifecycle;
mod message;
mod push;

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

pub use fetch::{BypassReason, FetchOutcome, FetchPolicy, FetchSource, Route};
pub use lifecycle::{ActivationReport, WorkerState};
pub use message::{ClientMessage, PushNotice, WorkerMessage};
pub use push::{click_target, ClickAction, Notification, PushData, PushOutcome};

use crate::clients::ClientRegistry;
use crate::net::Network;
use crate::store::CacheStore;

/// Background cache writes kept off the response path.
///
/// The writes outlive the request that started them but not the process:
/// [`PendingWrites::settle`] has to run before the runtime is dropped.
#[derive(Clone, Default)]
pub struct PendingWrites(Arc<Mutex<JoinSet<()>>>);

impl PendingWrites {
  fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn spawn<F>(&self, write: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let mut set = self.lock();
    // Reap finished writes so a long-running loop does not accumulate them
    while set.try_join_next().is_some() {}
    set.spawn(write);
  }

  /// Wait for every write started so far, including ones started while
  /// waiting. Returns how many were awaited.
  pub async fn settle(&self) -> usize {
    let mut settled = 0;
    loop {
      let mut set = std::mem::take(&mut *self.lock());
      if set.is_empty() {
        return settled;
      }
      while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
          warn!(error = %e, "background cache write did not finish");
        }
        settled += 1;
      }
    }
  }
}

/// Collaborators shared by every generation of the worker.
#[derive(Clone)]
pub struct WorkerContext {
  pub cache: Arc<dyn CacheStore>,
  pub network: Arc<dyn Network>,
  pub clients: Arc<ClientRegistry>,
  pub origin: Url,
  pub app_shell: Vec<String>,
  pub policy: FetchPolicy,
  pub writes: PendingWrites,
}

/// Side effect of a control message that the host has to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEffect {
  /// The waiting generation asked to be activated now
  SkipWaiting,
  CacheCleared {
    deleted: Vec<String>,
    notified: usize,
  },
}

pub struct Worker {
  tag: String,
  ctx: WorkerContext,
  state: watch::Sender<WorkerState>,
  skip_waiting: AtomicBool,
}

impl Worker {
  pub fn new(tag: impl Into<String>, ctx: WorkerContext) -> Self {
    let (state, _) = watch::channel(WorkerState::Parsed);
    Self {
      tag: tag.into(),
      ctx,
      state,
      skip_waiting: AtomicBool::new(false),
    }
  }

  /// Cache generation owned by this worker.
  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
    self.state.subscribe()
  }

  /// Whether the worker asked not to wait for old clients before activating.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub(crate) fn request_skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  fn transition(&self, next: WorkerState) -> Result<()> {
    let mut from = None;
    let changed = self.state.send_if_modified(|state| {
      from = Some(*state);
      if state.can_transition_to(next) {
        *state = next;
        true
      } else {
        false
      }
    });

    let from = from.unwrap_or(next);
    if !changed {
      return Err(eyre!(
        "Invalid state transition for {}: {} -> {}",
        self.tag,
        from,
        next
      ));
    }

    debug!(tag = %self.tag, %from, to = %next, "worker state change");
    Ok(())
  }

  /// Wait for the background cache writes of every generation sharing this
  /// context.
  pub async fn settle(&self) -> usize {
    self.ctx.writes.settle().await
  }

  /// Resolve once this worker is activated; fail if it becomes redundant first.
  pub async fn wait_activated(&self) -> Result<()> {
    let mut rx = self.subscribe();
    let state = *rx
      .wait_for(|s| matches!(s, WorkerState::Activated | WorkerState::Redundant))
      .await
      .map_err(|e| eyre!("Worker {} went away: {}", self.tag, e))?;

    match state {
      WorkerState::Activated => Ok(()),
      other => Err(eyre!("Worker {} ended in state {}", self.tag, other)),
    }
  }

  pub async fn on_message(&self, msg: ClientMessage) -> Result<MessageEffect> {
    debug!(tag = %self.tag, ?msg, "message received");
    match msg {
      ClientMessage::SkipWaiting => {
        info!(tag = %self.tag, "skip waiting requested");
        self.request_skip_waiting();
        Ok(MessageEffect::SkipWaiting)
      }
      ClientMessage::ClearCache => {
        let (deleted, notified) = self.clear_all_caches().await?;
        Ok(MessageEffect::CacheCleared { deleted, notified })
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::testing::*;
  use super::*;
  use crate::store::CacheStore;

  #[tokio::test]
  async fn test_invalid_transition_rejected() {
    let f = fixture();
    let worker = Worker::new("crm-cache-v10", f.ctx);

    assert!(worker.transition(WorkerState::Activated).is_err());
    assert_eq!(worker.state(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let f = fixture();
    let worker = Worker::new("crm-cache-v10", f.ctx);

    let effect = worker.on_message(ClientMessage::SkipWaiting).await.unwrap();
    assert_eq!(effect, MessageEffect::SkipWaiting);
    assert!(worker.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_clear_cache_acks_every_client_once() {
    let f = fixture();
    let mut a = f.clients.open(Url::parse(ORIGIN).unwrap());
    let mut b = f.clients.open(Url::parse(ORIGIN).unwrap());
    f.store.open("crm-cache-v1").await.unwrap();
    f.store.open("crm-cache-v10").await.unwrap();

    let worker = Worker::new("crm-cache-v10", f.ctx);
    let effect = worker.on_message(ClientMessage::ClearCache).await.unwrap();

    assert_eq!(
      effect,
      MessageEffect::CacheCleared {
        deleted: vec!["crm-cache-v1".to_string(), "crm-cache-v10".to_string()],
        notified: 2,
      }
    );
    assert!(f.store.list_generations().await.unwrap().is_empty());
    assert_eq!(a.drain(), vec![WorkerMessage::CacheCleared]);
    assert_eq!(b.drain(), vec![WorkerMessage::CacheCleared]);
  }

  #[tokio::test]
  async fn test_wait_activated_fails_when_redundant() {
    let f = fixture();
    let worker = Arc::new(Worker::new("crm-cache-v10", f.ctx));

    let waiter = {
      let worker = worker.clone();
      tokio::spawn(async move { worker.wait_activated().await })
    };
    worker.mark_redundant();

    assert!(waiter.await.unwrap().is_err());
  }
}

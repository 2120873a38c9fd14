//! Runtime adapter: owns the registration and drives worker generations.
//!
//! A registration holds at most one installing, one waiting and one active
//! worker. Clients talk to the host; the host forwards to whichever
//! generation is responsible and carries out the side effects the worker
//! asks for (activation, redundancy, queueing, offline API data).

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clients::ClientId;
use crate::data_cache::DataCache;
use crate::http::{Method, Request, Response};
use crate::queue::OfflineQueue;
use crate::reconcile::UpdateTarget;
use crate::worker::{
  ActivationReport, BypassReason, ClickAction, ClientMessage, FetchOutcome, FetchSource,
  MessageEffect, PushData, PushOutcome, Route, Worker, WorkerContext, WorkerMessage, WorkerState,
};

#[derive(Default)]
struct Registration {
  installing: Option<Arc<Worker>>,
  waiting: Option<Arc<Worker>>,
  active: Option<Arc<Worker>>,
}

/// A response handed back to a client, and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
  pub response: Response,
  pub source: FetchSource,
}

/// Tags of the generations currently held by the registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationStatus {
  pub installing: Option<String>,
  pub waiting: Option<String>,
  pub active: Option<String>,
}

pub struct Host {
  ctx: WorkerContext,
  tag: String,
  registration: Mutex<Registration>,
  queue: Option<OfflineQueue>,
  data: Option<DataCache>,
  activations: broadcast::Sender<String>,
}

impl Host {
  /// `tag` names the generation that `register` installs.
  pub fn new(ctx: WorkerContext, tag: impl Into<String>) -> Self {
    let (activations, _) = broadcast::channel(16);
    Self {
      ctx,
      tag: tag.into(),
      registration: Mutex::new(Registration::default()),
      queue: None,
      data: None,
      activations,
    }
  }

  pub fn with_queue(mut self, queue: OfflineQueue) -> Self {
    self.queue = Some(queue);
    self
  }

  pub fn with_data_cache(mut self, data: DataCache) -> Self {
    self.data = Some(data);
    self
  }

  fn lock(&self) -> MutexGuard<'_, Registration> {
    self.registration.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn queue(&self) -> Option<&OfflineQueue> {
    self.queue.as_ref()
  }

  pub fn active(&self) -> Option<Arc<Worker>> {
    self.lock().active.clone()
  }

  pub fn waiting(&self) -> Option<Arc<Worker>> {
    self.lock().waiting.clone()
  }

  pub fn status(&self) -> RegistrationStatus {
    let reg = self.lock();
    let tag = |w: &Option<Arc<Worker>>| w.as_ref().map(|w| w.tag().to_string());
    RegistrationStatus {
      installing: tag(&reg.installing),
      waiting: tag(&reg.waiting),
      active: tag(&reg.active),
    }
  }

  /// Wait for cache writes the workers started in the background.
  /// Call before the runtime goes away.
  pub async fn settle(&self) -> usize {
    let settled = self.ctx.writes.settle().await;
    if settled > 0 {
      debug!(settled, "background cache writes finished");
    }
    settled
  }

  /// Tags of generations that finished activating, in order.
  pub fn subscribe_activations(&self) -> broadcast::Receiver<String> {
    self.activations.subscribe()
  }

  /// Install the configured generation and activate it when allowed.
  pub async fn register(&self) -> Result<Arc<Worker>> {
    let tag = self.tag.clone();
    self.register_tag(&tag).await
  }

  /// Install `tag` unless it is already active, then activate it if it asked
  /// to skip waiting or nothing is active yet.
  pub async fn register_tag(&self, tag: &str) -> Result<Arc<Worker>> {
    if let Some(active) = self.active() {
      if active.tag() == tag && active.state() == WorkerState::Activated {
        debug!(tag, "already active");
        return Ok(active);
      }
    }

    let worker = self.install(tag).await?;
    let has_active = self.lock().active.is_some();
    if worker.skip_waiting_requested() || !has_active {
      self.activate_waiting().await?;
    } else {
      info!(tag, "installed, waiting for old clients");
    }
    Ok(worker)
  }

  /// Reuse the configured generation if an earlier run installed it,
  /// otherwise register it from the network.
  pub async fn start(&self) -> Result<Arc<Worker>> {
    if let Some(active) = self.active() {
      return Ok(active);
    }

    let worker = Arc::new(Worker::new(self.tag.clone(), self.ctx.clone()));
    match worker.on_resume().await {
      Ok(()) => {
        self.lock().active = Some(worker.clone());
        let _ = self.activations.send(worker.tag().to_string());
        Ok(worker)
      }
      Err(e) => {
        debug!(tag = %self.tag, error = %e, "nothing to resume, registering");
        self.register().await
      }
    }
  }

  /// Install a generation and park it as the waiting worker.
  pub async fn install(&self, tag: &str) -> Result<Arc<Worker>> {
    let worker = Arc::new(Worker::new(tag, self.ctx.clone()));
    if let Some(previous) = self.lock().installing.replace(worker.clone()) {
      previous.mark_redundant();
    }

    let installed = worker.on_install().await;

    let mut reg = self.lock();
    if reg
      .installing
      .as_ref()
      .map(|w| Arc::ptr_eq(w, &worker))
      .unwrap_or(false)
    {
      reg.installing = None;
    }
    installed?;

    if let Some(previous) = reg.waiting.replace(worker.clone()) {
      previous.mark_redundant();
    }
    Ok(worker)
  }

  /// Promote the waiting worker; the previous active one becomes redundant.
  pub async fn activate_waiting(&self) -> Result<ActivationReport> {
    let (next, previous) = {
      let mut reg = self.lock();
      let next = reg
        .waiting
        .take()
        .ok_or_else(|| eyre!("No waiting worker to activate"))?;
      (next, reg.active.take())
    };

    if let Some(previous) = previous {
      info!(old = %previous.tag(), new = %next.tag(), "replacing active worker");
      previous.mark_redundant();
    }

    let report = next.on_activate().await?;
    self.lock().active = Some(next.clone());
    let _ = self.activations.send(next.tag().to_string());

    Ok(report)
  }

  /// Drop every generation of the registration. Clients lose their controller.
  pub fn unregister(&self) -> usize {
    let workers: Vec<Arc<Worker>> = {
      let mut reg = self.lock();
      [reg.installing.take(), reg.waiting.take(), reg.active.take()]
        .into_iter()
        .flatten()
        .collect()
    };

    for worker in &workers {
      worker.mark_redundant();
    }
    self.ctx.clients.release_all();
    info!(count = workers.len(), "registration removed");
    workers.len()
  }

  /// Deliver a raw control message from a client.
  ///
  /// Messages are accepted only from open clients on the configured origin.
  pub async fn post_message(&self, from: ClientId, raw: &str) -> Result<MessageEffect> {
    let client = self
      .ctx
      .clients
      .get(from)
      .ok_or_else(|| eyre!("Unknown client {}", from))?;
    if client.url.origin() != self.ctx.origin.origin() {
      warn!(client = from, url = %client.url, "message from foreign origin rejected");
      return Err(eyre!("Message from foreign origin {}", client.url));
    }

    let msg = ClientMessage::parse(raw)?;
    match msg {
      ClientMessage::SkipWaiting => {
        let Some(waiting) = self.waiting() else {
          debug!(client = from, "skip waiting without a waiting worker");
          return Ok(MessageEffect::SkipWaiting);
        };
        let effect = waiting.on_message(msg).await?;
        self.activate_waiting().await?;
        Ok(effect)
      }
      ClientMessage::ClearCache => {
        let worker = {
          let reg = self.lock();
          reg.active.clone().or_else(|| reg.waiting.clone())
        }
        .ok_or_else(|| eyre!("No worker to handle {:?}", msg))?;
        worker.on_message(msg).await
      }
    }
  }

  /// Run a client request through the active worker.
  ///
  /// Requests the worker passes through go to the network directly. API
  /// reads that fail there are answered from the data cache; a queueable
  /// write is stored for replay and answered with the offline placeholder.
  pub async fn fetch(&self, request: &Request) -> Result<Fetched> {
    let outcome = match self.active() {
      Some(worker) => worker.on_fetch(request).await,
      None => {
        debug!(url = %request.url, "no active worker");
        return self.fetch_direct(request).await;
      }
    };

    match outcome {
      FetchOutcome::Responded { response, source } => Ok(Fetched { response, source }),
      FetchOutcome::Passthrough(_) => self.fetch_direct(request).await,
    }
  }

  async fn fetch_direct(&self, request: &Request) -> Result<Fetched> {
    let data = self.data.as_ref().filter(|_| self.is_api_read(request));

    match self.ctx.network.fetch(request).await {
      Ok(response) => {
        if let Some(data) = data.filter(|_| response.status == 200) {
          if let Err(e) = data.set(&request.url, response.body.clone()).await {
            warn!(url = %request.url, error = %e, "failed to keep API response");
          }
        }
        Ok(Fetched {
          response,
          source: FetchSource::Network,
        })
      }
      Err(e) => {
        if let Some(data) = data {
          match data.get(&request.url).await {
            Ok(Some(response)) => {
              info!(url = %request.url, "served from data cache");
              return Ok(Fetched {
                response,
                source: FetchSource::Data,
              });
            }
            Ok(None) => {}
            Err(le) => warn!(url = %request.url, error = %le, "data cache lookup failed"),
          }
        }
        self.queue_or_fail(request, e).await
      }
    }
  }

  fn is_api_read(&self, request: &Request) -> bool {
    request.method == Method::Get
      && self.ctx.policy.route(request) == Route::Bypass(BypassReason::Api)
  }

  async fn queue_or_fail(&self, request: &Request, e: color_eyre::Report) -> Result<Fetched> {
    match &self.queue {
      Some(queue) if queue.should_queue(request) => {
        queue.enqueue(request).await?;
        Ok(Fetched {
          response: Response::offline(),
          source: FetchSource::Queued,
        })
      }
      _ => Err(e),
    }
  }

  pub fn push(&self, payload: Option<&[u8]>) -> Result<PushOutcome> {
    let worker = self.active().ok_or_else(|| eyre!("No active worker to receive push"))?;
    Ok(worker.on_push(payload))
  }

  pub fn notification_click(&self, data: &PushData) -> Result<ClickAction> {
    let worker = self
      .active()
      .ok_or_else(|| eyre!("No active worker to handle notification click"))?;
    Ok(worker.on_notification_click(data))
  }
}

#[async_trait]
impl UpdateTarget for Host {
  async fn unregister_all(&self) -> Result<usize> {
    Ok(self.unregister())
  }

  async fn register_fresh(&self) -> Result<()> {
    let worker = self.register().await?;
    worker.wait_activated().await
  }

  fn reload(&self, version: &str) -> usize {
    self.ctx.clients.broadcast(&WorkerMessage::Reload {
      version: version.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{CacheStore, MemoryStore};
  use crate::worker::testing::*;
  use std::time::Duration;
  use url::Url;

  fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
  }

  fn request(method: Method, path: &str) -> Request {
    Request::resolve(method, &origin(), path).unwrap()
  }

  #[tokio::test]
  async fn test_register_activates_and_claims() {
    let f = fixture();
    let mut tab = f.clients.open(origin());
    let host = Host::new(f.ctx, "crm-cache-v10");
    let mut activations = host.subscribe_activations();

    let worker = host.register().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Activated);
    assert_eq!(host.status().active.as_deref(), Some("crm-cache-v10"));
    assert_eq!(activations.recv().await.unwrap(), "crm-cache-v10");
    assert_eq!(
      tab.drain(),
      vec![WorkerMessage::ControllerChange {
        tag: "crm-cache-v10".to_string()
      }]
    );

    // Registering the active tag again is a no-op
    let again = host.register().await.unwrap();
    assert!(Arc::ptr_eq(&worker, &again));
    assert!(tab.drain().is_empty());
  }

  #[tokio::test]
  async fn test_new_generation_replaces_old() {
    let f = fixture();
    let host = Host::new(f.ctx, "crm-cache-v10");
    let old = host.register_tag("crm-cache-v9").await.unwrap();
    host.register().await.unwrap();

    assert_eq!(old.state(), WorkerState::Redundant);
    assert_eq!(
      f.store.list_generations().await.unwrap(),
      vec!["crm-cache-v10".to_string()]
    );
  }

  #[tokio::test]
  async fn test_failed_install_keeps_active_worker() {
    let f = fixture();
    let host = Host::new(f.ctx, "crm-cache-v10");
    host.register_tag("crm-cache-v9").await.unwrap();

    f.network.set_online(false);
    assert!(host.register().await.is_err());
    assert_eq!(host.status().active.as_deref(), Some("crm-cache-v9"));
    assert_eq!(host.status().waiting, None);
  }

  #[tokio::test]
  async fn test_start_resumes_installed_generation_offline() {
    let f = fixture();
    Host::new(f.ctx.clone(), "crm-cache-v10").register().await.unwrap();

    f.network.set_online(false);
    let restarted = Host::new(f.ctx, "crm-cache-v10");
    let worker = restarted.start().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Activated);

    let fetched = restarted.fetch(&request(Method::Get, "/")).await.unwrap();
    assert_eq!(fetched.source, FetchSource::Cache);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_waiting() {
    let f = fixture();
    let tab = f.clients.open(origin());
    let host = Host::new(f.ctx, "crm-cache-v10");
    host.register_tag("crm-cache-v9").await.unwrap();
    host.install("crm-cache-v10").await.unwrap();
    assert_eq!(host.status().waiting.as_deref(), Some("crm-cache-v10"));

    let effect = host
      .post_message(tab.id, r#"{"type":"SKIP_WAITING"}"#)
      .await
      .unwrap();
    assert_eq!(effect, MessageEffect::SkipWaiting);
    assert_eq!(host.status().active.as_deref(), Some("crm-cache-v10"));
    assert_eq!(host.status().waiting, None);
  }

  #[tokio::test]
  async fn test_messages_checked_before_dispatch() {
    let f = fixture();
    let local = f.clients.open(origin());
    let foreign = f.clients.open(Url::parse("https://evil.example.net/").unwrap());
    let host = Host::new(f.ctx, "crm-cache-v10");
    host.register().await.unwrap();

    assert!(host
      .post_message(foreign.id, r#"{"type":"CLEAR_CACHE"}"#)
      .await
      .is_err());
    assert!(host.post_message(local.id, r#"{"type":"NUKE"}"#).await.is_err());
    assert!(host.post_message(999, r#"{"type":"CLEAR_CACHE"}"#).await.is_err());
    assert_eq!(f.store.list_generations().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_clear_cache_message() {
    let f = fixture();
    let mut tab = f.clients.open(origin());
    let host = Host::new(f.ctx, "crm-cache-v10");
    host.register().await.unwrap();
    tab.drain();

    let effect = host
      .post_message(tab.id, r#"{"type":"CLEAR_CACHE"}"#)
      .await
      .unwrap();
    assert!(matches!(effect, MessageEffect::CacheCleared { notified: 1, .. }));
    assert!(f.store.list_generations().await.unwrap().is_empty());
    assert_eq!(tab.drain(), vec![WorkerMessage::CacheCleared]);
  }

  #[tokio::test]
  async fn test_offline_write_is_queued() {
    let f = fixture();
    let queue = OfflineQueue::new(Arc::new(MemoryStore::new()), vec!["/api/reminders".to_string()]);
    let host = Host::new(f.ctx, "crm-cache-v10").with_queue(queue);
    host.register().await.unwrap();
    f.network.set_online(false);

    let fetched = host
      .fetch(&request(Method::Post, "/api/reminders").with_body("{}"))
      .await
      .unwrap();
    assert_eq!(fetched.source, FetchSource::Queued);
    assert_eq!(fetched.response.status, 503);
    assert_eq!(host.queue().unwrap().pending().await.unwrap().len(), 1);

    // Not a queueable write: the failure reaches the caller
    assert!(host.fetch(&request(Method::Get, "/api/version")).await.is_err());
  }

  #[tokio::test]
  async fn test_fetch_through_active_worker() {
    let f = fixture();
    let host = Host::new(f.ctx, "crm-cache-v10");

    // Before registration everything goes to the network
    let direct = host.fetch(&request(Method::Get, "/static/manifest.json")).await.unwrap();
    assert_eq!(direct.source, FetchSource::Network);

    host.register().await.unwrap();
    f.network.set_online(false);
    let cached = host.fetch(&request(Method::Get, "/static/manifest.json")).await.unwrap();
    assert_eq!(cached.source, FetchSource::Cache);
    assert_eq!(cached.response.text(), "/static/manifest.json");
  }

  #[tokio::test]
  async fn test_offline_api_read_served_from_data_cache() {
    let f = fixture();
    let data = DataCache::new(Arc::new(MemoryStore::new()));
    let host = Host::new(f.ctx, "crm-cache-v10").with_data_cache(data.clone());
    host.register().await.unwrap();
    f.network.route(&format!("{}/api/chats", ORIGIN), Response::ok(r#"[{"id":3}]"#));
    f.network.route(&format!("{}/api/chats/3", ORIGIN), Response::new(404, "missing"));

    let online = host.fetch(&request(Method::Get, "/api/chats")).await.unwrap();
    assert_eq!(online.source, FetchSource::Network);
    host.fetch(&request(Method::Get, "/api/chats/3")).await.unwrap();
    // Only the 200 was kept
    assert_eq!(data.len().await.unwrap(), 1);

    f.network.set_online(false);
    let offline = host.fetch(&request(Method::Get, "/api/chats")).await.unwrap();
    assert_eq!(offline.source, FetchSource::Data);
    assert_eq!(offline.response.text(), r#"[{"id":3}]"#);
    assert_eq!(offline.response.header("Content-Type"), Some("application/json"));

    assert!(host.fetch(&request(Method::Get, "/api/chats/3")).await.is_err());
  }

  #[tokio::test]
  async fn test_settle_finishes_background_writes() {
    let f = fixture();
    f.network.route(&format!("{}/static/app.js", ORIGIN), Response::ok("js"));
    let host = Host::new(f.ctx, "crm-cache-v10");
    host.register().await.unwrap();

    host.fetch(&request(Method::Get, "/static/app.js")).await.unwrap();
    assert_eq!(host.settle().await, 1);
    assert_eq!(f.store.entry_count("crm-cache-v10").await.unwrap(), 4);
  }

  #[tokio::test]
  async fn test_forced_update_target() {
    let f = fixture();
    let mut tab = f.clients.open(origin());
    let host = Host::new(f.ctx, "crm-cache-v10");
    let first = host.register().await.unwrap();
    tab.drain();

    assert_eq!(host.unregister_all().await.unwrap(), 1);
    assert_eq!(first.state(), WorkerState::Redundant);
    assert!(f.clients.get(tab.id).unwrap().controller.is_none());

    tokio::time::timeout(Duration::from_secs(1), host.register_fresh())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(host.reload("2024121302"), 1);

    let messages = tab.drain();
    assert_eq!(
      messages.last(),
      Some(&WorkerMessage::Reload {
        version: "2024121302".to_string()
      })
    );
  }
}

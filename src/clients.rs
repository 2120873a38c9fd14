//! Registry of live client instances (tabs/windows) bound to the worker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::worker::WorkerMessage;

pub type ClientId = u64;

/// Point-in-time view of a client. Never hold on to it: clients close at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub id: ClientId,
  pub url: Url,
  pub focused: bool,
  pub visible: bool,
  /// Generation tag controlling this client, if any
  pub controller: Option<String>,
}

struct Client {
  info: ClientInfo,
  tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// Receiving side of a client, owned by whoever plays the tab.
pub struct ClientHandle {
  pub id: ClientId,
  rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl ClientHandle {
  /// Drain every message already delivered.
  pub fn drain(&mut self) -> Vec<WorkerMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = self.rx.try_recv() {
      out.push(msg);
    }
    out
  }
}

/// Non-owning set of client instances.
#[derive(Default)]
pub struct ClientRegistry {
  next_id: AtomicU64,
  clients: Mutex<BTreeMap<ClientId, Client>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<ClientId, Client>> {
    self.clients.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Open a new client at `url`. New clients start focused and visible,
  /// taking focus from every other client.
  pub fn open(&self, url: Url) -> ClientHandle {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let (tx, rx) = mpsc::unbounded_channel();

    let mut clients = self.lock();
    for client in clients.values_mut() {
      client.info.focused = false;
    }
    clients.insert(
      id,
      Client {
        info: ClientInfo {
          id,
          url,
          focused: true,
          visible: true,
          controller: None,
        },
        tx,
      },
    );
    drop(clients);
    debug!(client = id, "client opened");

    ClientHandle { id, rx }
  }

  pub fn get(&self, id: ClientId) -> Option<ClientInfo> {
    self.lock().get(&id).map(|c| c.info.clone())
  }

  /// Focus one client; every other client loses focus.
  pub fn focus(&self, id: ClientId) -> bool {
    let mut clients = self.lock();
    if !clients.contains_key(&id) {
      return false;
    }
    for (cid, client) in clients.iter_mut() {
      client.info.focused = *cid == id;
      if *cid == id {
        client.info.visible = true;
      }
    }
    true
  }

  #[cfg(test)]
  pub fn set_focused(&self, id: ClientId, focused: bool) {
    if let Some(client) = self.lock().get_mut(&id) {
      client.info.focused = focused;
    }
  }

  pub fn set_visible(&self, id: ClientId, visible: bool) {
    if let Some(client) = self.lock().get_mut(&id) {
      client.info.visible = visible;
      if !visible {
        client.info.focused = false;
      }
    }
  }

  /// Enumerate the clients that are still open, dropping closed ones.
  pub fn snapshot(&self) -> Vec<ClientInfo> {
    let mut clients = self.lock();
    clients.retain(|_, c| !c.tx.is_closed());
    clients.values().map(|c| c.info.clone()).collect()
  }

  #[cfg(test)]
  pub fn any_focused(&self) -> bool {
    self.snapshot().iter().any(|c| c.focused)
  }

  /// Deliver a message to every open client, returning how many received it.
  pub fn broadcast(&self, msg: &WorkerMessage) -> usize {
    let mut clients = self.lock();
    clients.retain(|_, c| c.tx.send(msg.clone()).is_ok());
    clients.len()
  }

  /// Make `tag` the controller of every open client.
  ///
  /// Clients that change controller are told with `CONTROLLER_CHANGE`.
  pub fn claim(&self, tag: &str) -> usize {
    let mut clients = self.lock();
    clients.retain(|_, c| !c.tx.is_closed());

    let mut changed = 0;
    for client in clients.values_mut() {
      if client.info.controller.as_deref() != Some(tag) {
        client.info.controller = Some(tag.to_string());
        let _ = client.tx.send(WorkerMessage::ControllerChange {
          tag: tag.to_string(),
        });
        changed += 1;
      }
    }
    changed
  }

  /// Drop the controller of every client (the registration went away).
  pub fn release_all(&self) {
    for client in self.lock().values_mut() {
      client.info.controller = None;
    }
  }
}

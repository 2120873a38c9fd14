use crate::clients::{ClientHandle, ClientRegistry};
use crate::commands::{self, CommandKind};
use crate::config::Config;
use crate::data_cache::DataCache;
use crate::event::{Event, EventHandler};
use crate::host::{Fetched, Host, RegistrationStatus};
use crate::http::{Method, Request};
use crate::net::{HttpNetwork, Network};
use crate::queue::{FlushReport, OfflineQueue};
use crate::reconcile::{HttpVersionSource, Outcome, Reconciler, Trigger};
use crate::store::{PendingAction, Stores};
use crate::worker::{
  ActivationReport, ClickAction, MessageEffect, PendingWrites, PushData, WorkerContext,
  WorkerMessage,
};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot of everything persisted plus the in-memory registration.
#[derive(Debug, Clone)]
pub struct StatusReport {
  pub version: Option<String>,
  pub last_check: Option<DateTime<Utc>>,
  /// Generation tags with their entry counts, oldest first
  pub generations: Vec<(String, usize)>,
  pub registration: RegistrationStatus,
  pub pending: usize,
  /// Unexpired and expired API responses kept for offline reads
  pub data_entries: usize,
}

impl fmt::Display for StatusReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "version:    {}", self.version.as_deref().unwrap_or("-"))?;
    match self.last_check {
      Some(at) => writeln!(f, "last check: {}", at.to_rfc3339())?,
      None => writeln!(f, "last check: -")?,
    }
    writeln!(
      f,
      "active:     {}",
      self.registration.active.as_deref().unwrap_or("-")
    )?;
    if let Some(waiting) = &self.registration.waiting {
      writeln!(f, "waiting:    {}", waiting)?;
    }
    writeln!(f, "generations:")?;
    if self.generations.is_empty() {
      writeln!(f, "  (none)")?;
    }
    for (tag, count) in &self.generations {
      writeln!(f, "  {} ({} entries)", tag, count)?;
    }
    writeln!(f, "queued writes: {}", self.pending)?;
    write!(f, "data entries:  {}", self.data_entries)
  }
}

/// Wires configuration, storage, network and the worker host together.
pub struct App {
  config: Config,
  stores: Stores,
  network: Arc<dyn Network>,
  clients: Arc<ClientRegistry>,
  host: Arc<Host>,
  reconciler: Reconciler,
  data: DataCache,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let stores = Stores::open(config.storage, config.db_path.as_deref())?;
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(config.check_timeout())?);
    Self::with_parts(config, stores, network)
  }

  pub fn with_parts(config: Config, stores: Stores, network: Arc<dyn Network>) -> Result<Self> {
    let clients = Arc::new(ClientRegistry::new());

    let ctx = WorkerContext {
      cache: stores.cache.clone(),
      network: network.clone(),
      clients: clients.clone(),
      origin: config.origin.clone(),
      app_shell: config.app_shell.clone(),
      policy: config.fetch.clone(),
      writes: PendingWrites::default(),
    };
    let queue = OfflineQueue::new(stores.queue.clone(), config.queue_paths.clone());
    let data = DataCache::new(stores.data.clone())
      .with_ttl(config.data_ttl())
      .with_max_entries(config.data_max_entries);
    let host = Arc::new(
      Host::new(ctx, config.generation_tag())
        .with_queue(queue)
        .with_data_cache(data.clone()),
    );

    let source = HttpVersionSource::new(
      network.clone(),
      config.version_url()?,
      config.check_timeout(),
    );
    let reconciler = Reconciler::new(
      Arc::new(source),
      stores.versions.clone(),
      stores.cache.clone(),
      host.clone(),
      config.visibility_cooldown(),
    )
    .with_data_cache(data.clone());

    Ok(Self {
      config,
      stores,
      network,
      clients,
      host,
      reconciler,
      data,
    })
  }

  /// Open a client tab at the configured origin.
  pub fn open_client(&self) -> ClientHandle {
    self.clients.open(self.config.origin.clone())
  }

  pub async fn install(&self) -> Result<ActivationReport> {
    let tag = self.host.tag().to_string();
    self.host.install(&tag).await?;
    self.host.activate_waiting().await
  }

  /// Finish background work before the process exits.
  pub async fn shutdown(&self) {
    self.host.settle().await;
  }

  /// Bring up the worker, tolerating an unreachable network.
  async fn start(&self) {
    if let Err(e) = self.host.start().await {
      warn!(error = %e, "worker not started, requests go straight to the network");
    }
  }

  pub async fn fetch(&self, method: Method, target: &str, body: Option<String>) -> Result<Fetched> {
    self.start().await;
    let mut request = Request::resolve(method, &self.config.origin, target)?;
    if let Some(body) = body {
      request = request
        .with_header("Content-Type", "application/json")
        .with_body(body);
    }
    let fetched = self.host.fetch(&request).await;
    // The response may have started a cache write; it has to land before
    // a one-shot run drops the runtime
    self.host.settle().await;
    fetched
  }

  pub async fn check(&self) -> Result<Outcome> {
    self.start().await;
    self.reconciler.check(Trigger::Manual).await
  }

  pub async fn clear(&self) -> Result<MessageEffect> {
    self.start().await;
    let client = self.open_client();
    self
      .host
      .post_message(client.id, r#"{"type":"CLEAR_CACHE"}"#)
      .await
  }

  pub async fn status(&self) -> Result<StatusReport> {
    let mut generations = Vec::new();
    for tag in self.stores.cache.list_generations().await? {
      let count = self.stores.cache.entry_count(&tag).await?;
      generations.push((tag, count));
    }

    Ok(StatusReport {
      version: self.stores.versions.get_version().await?,
      last_check: self.stores.versions.last_check().await?,
      generations,
      registration: self.host.status(),
      pending: self.stores.queue.pending_actions().await?.len(),
      data_entries: self.data.len().await?,
    })
  }

  pub async fn queue_list(&self) -> Result<Vec<PendingAction>> {
    self.stores.queue.pending_actions().await
  }

  pub async fn queue_flush(&self) -> Result<FlushReport> {
    let queue = self
      .host
      .queue()
      .ok_or_else(|| eyre!("Offline queue is not configured"))?;
    queue.flush(self.network.as_ref()).await
  }

  /// Run the event loop until ctrl-c, end of input or `quit`.
  pub async fn watch(&self) -> Result<()> {
    let mut tab = self.open_client();
    let mut events = EventHandler::new(self.config.poll_interval(), self.host.subscribe_activations());

    // Activation arrives as an event and runs the first check
    self.start().await;
    self.print_messages(&mut tab);
    println!("watching {} (type a command, `quit` to stop)", self.config.origin);

    while let Some(event) = events.next().await {
      let keep_going = match event {
        Event::Tick => {
          if self.run_check(Trigger::Poll).await != Some(Outcome::CheckFailed) {
            self.flush_if_pending().await;
          }
          true
        }
        Event::Activated(tag) => {
          info!(tag = %tag, "generation activated");
          self.run_check(Trigger::Activated).await;
          true
        }
        Event::Input(line) => self.handle_command(&tab, &line).await,
        Event::Shutdown => false,
      };
      self.print_messages(&mut tab);

      if !keep_going {
        break;
      }
    }

    self.shutdown().await;
    info!("watch stopped");
    Ok(())
  }

  async fn run_check(&self, trigger: Trigger) -> Option<Outcome> {
    match self.reconciler.check(trigger).await {
      Ok(outcome) => {
        if let Outcome::Updated { from, to } = &outcome {
          println!("updated {} -> {}", from.as_deref().unwrap_or("none"), to);
        }
        Some(outcome)
      }
      Err(e) => {
        warn!(%trigger, error = %e, "forced update failed");
        None
      }
    }
  }

  async fn flush_if_pending(&self) {
    let Some(queue) = self.host.queue() else {
      return;
    };
    match queue.pending().await {
      Ok(pending) if !pending.is_empty() => {
        if let Err(e) = queue.flush(self.network.as_ref()).await {
          warn!(error = %e, "failed to flush offline queue");
        }
      }
      Ok(_) => {}
      Err(e) => warn!(error = %e, "failed to read offline queue"),
    }
  }

  /// Returns false when the loop should stop.
  async fn handle_command(&self, tab: &ClientHandle, line: &str) -> bool {
    if line.trim().is_empty() {
      return true;
    }
    let Some((cmd, arg)) = commands::parse_line(line) else {
      println!("unknown command: {}", line.trim());
      for cmd in commands::COMMANDS {
        println!("  {:<8} {}", cmd.name, cmd.description);
      }
      return true;
    };

    match self.run_command(tab, cmd.kind, arg).await {
      Ok(keep_going) => keep_going,
      Err(e) => {
        println!("error: {}", e);
        true
      }
    }
  }

  async fn run_command(&self, tab: &ClientHandle, kind: CommandKind, arg: &str) -> Result<bool> {
    match kind {
      CommandKind::Check => {
        let outcome = self.reconciler.check(Trigger::Manual).await?;
        println!("{:?}", outcome);
      }
      CommandKind::Visible => {
        self.clients.focus(tab.id);
        let outcome = self.reconciler.check(Trigger::Visible).await?;
        println!("{:?}", outcome);
      }
      CommandKind::Hidden => self.clients.set_visible(tab.id, false),
      CommandKind::Clear => {
        let effect = self
          .host
          .post_message(tab.id, r#"{"type":"CLEAR_CACHE"}"#)
          .await?;
        println!("{:?}", effect);
      }
      CommandKind::SkipWaiting => {
        self
          .host
          .post_message(tab.id, r#"{"type":"SKIP_WAITING"}"#)
          .await?;
      }
      CommandKind::Push => {
        let payload = (!arg.is_empty()).then(|| arg.as_bytes());
        let outcome = self.host.push(payload)?;
        match outcome.shown {
          Some(n) => println!("notification: {} - {}", n.title, n.body),
          None => println!("notification suppressed (client focused)"),
        }
      }
      CommandKind::Click => {
        let data: PushData = if arg.is_empty() {
          PushData::default()
        } else {
          serde_json::from_str(arg).map_err(|e| eyre!("Invalid notification data: {}", e))?
        };
        match self.host.notification_click(&data)? {
          ClickAction::Focus(id) => println!("focused client {}", id),
          ClickAction::Open(url) => println!("open {}", url),
        }
      }
      CommandKind::Flush => {
        let report = self.queue_flush().await?;
        println!("replayed {} ({} failed)", report.sent, report.failed);
      }
      CommandKind::Status => println!("{}", self.status().await?),
      CommandKind::Quit => return Ok(false),
    }
    Ok(true)
  }

  fn print_messages(&self, tab: &mut ClientHandle) {
    for msg in tab.drain() {
      match &msg {
        WorkerMessage::Reload { version } => println!("reload requested for version {}", version),
        other => match other.to_json() {
          Ok(json) => println!("<- {}", json),
          Err(e) => warn!(error = %e, "failed to encode message"),
        },
      }
    }
  }
}

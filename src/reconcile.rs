//! Version drift detection and forced update.
//!
//! The server publishes the current application version. When it differs
//! from the durable version record, every registration, every cache
//! generation and the API data cache are thrown away, a fresh worker is
//! registered and clients are told to reload once.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::data_cache::DataCache;
use crate::http::Request;
use crate::net::Network;
use crate::store::{CacheStore, VersionStore};

/// What the reconciler drives during a forced update.
#[async_trait]
pub trait UpdateTarget: Send + Sync {
  /// Unregister every registration, returning how many went away.
  async fn unregister_all(&self) -> Result<usize>;

  /// Register a new worker and resolve once it is activated.
  async fn register_fresh(&self) -> Result<()>;

  /// Ask every client to reload, returning how many were told.
  fn reload(&self, version: &str) -> usize;
}

/// Where the authoritative version comes from.
#[async_trait]
pub trait VersionSource: Send + Sync {
  async fn fetch_version(&self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
  version: Option<String>,
}

/// Reads `{ "version": "..." }` from an HTTP endpoint, bypassing caches.
pub struct HttpVersionSource {
  network: Arc<dyn Network>,
  url: Url,
  timeout: Duration,
}

impl HttpVersionSource {
  pub fn new(network: Arc<dyn Network>, url: Url, timeout: Duration) -> Self {
    Self {
      network,
      url,
      timeout,
    }
  }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
  async fn fetch_version(&self) -> Result<String> {
    let request = Request::get(self.url.clone())
      .with_header("Cache-Control", "no-cache")
      .with_header("Pragma", "no-cache");

    let response = tokio::time::timeout(self.timeout, self.network.fetch(&request))
      .await
      .map_err(|_| eyre!("Version check timed out after {:?}", self.timeout))??;

    if !response.is_success() {
      return Err(eyre!("Version endpoint returned {}", response.status));
    }

    let info: VersionInfo = serde_json::from_slice(&response.body)
      .map_err(|e| eyre!("Failed to parse version response: {}", e))?;

    match info.version.map(|v| v.trim().to_string()) {
      Some(v) if !v.is_empty() => Ok(v),
      _ => Err(eyre!("Version response has no version")),
    }
  }
}

/// Why a reconciliation was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
  Poll,
  /// A client became visible; subject to the shared cooldown
  Visible,
  Activated,
  Manual,
}

impl fmt::Display for Trigger {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Poll => "poll",
      Self::Visible => "visible",
      Self::Activated => "activated",
      Self::Manual => "manual",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  UpToDate(String),
  Updated { from: Option<String>, to: String },
  /// No usable answer from the server; nothing changed
  CheckFailed,
  /// A forced update is already running
  Busy,
  /// A visibility check ran recently, possibly in another instance
  CoolingDown,
  /// This session already applied the server's version
  AlreadyApplied(String),
}

/// Clears the busy flag however the reconciliation ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

pub struct Reconciler {
  source: Arc<dyn VersionSource>,
  versions: Arc<dyn VersionStore>,
  cache: Arc<dyn CacheStore>,
  target: Arc<dyn UpdateTarget>,
  data: Option<DataCache>,
  cooldown: Duration,
  busy: AtomicBool,
  applied: Mutex<Option<String>>,
}

impl Reconciler {
  pub fn new(
    source: Arc<dyn VersionSource>,
    versions: Arc<dyn VersionStore>,
    cache: Arc<dyn CacheStore>,
    target: Arc<dyn UpdateTarget>,
    cooldown: Duration,
  ) -> Self {
    Self {
      source,
      versions,
      cache,
      target,
      data: None,
      cooldown,
      busy: AtomicBool::new(false),
      applied: Mutex::new(None),
    }
  }

  /// Also clear this data cache on a forced update.
  pub fn with_data_cache(mut self, data: DataCache) -> Self {
    self.data = Some(data);
    self
  }

  #[cfg(test)]
  pub fn is_busy(&self) -> bool {
    self.busy.load(Ordering::SeqCst)
  }

  fn applied(&self) -> Option<String> {
    self
      .applied
      .lock()
      .map(|a| a.clone())
      .unwrap_or_else(|p| p.into_inner().clone())
  }

  fn set_applied(&self, version: &str) {
    let mut applied = self.applied.lock().unwrap_or_else(|p| p.into_inner());
    *applied = Some(version.to_string());
  }

  /// Compare the local and server versions and force an update on drift.
  ///
  /// Only a failure of the forced update itself is an error; failed checks
  /// are reported as [`Outcome::CheckFailed`].
  pub async fn check(&self, trigger: Trigger) -> Result<Outcome> {
    if self
      .busy
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!(%trigger, "reconciliation already running");
      return Ok(Outcome::Busy);
    }
    let _guard = BusyGuard(&self.busy);

    if trigger == Trigger::Visible && self.cooling_down().await {
      debug!("visibility check skipped, cooling down");
      return Ok(Outcome::CoolingDown);
    }

    let server = match self.source.fetch_version().await {
      Ok(v) => v,
      Err(e) => {
        warn!(%trigger, error = %e, "version check failed");
        return Ok(Outcome::CheckFailed);
      }
    };

    let local = match self.versions.get_version().await {
      Ok(v) => v,
      Err(e) => {
        warn!(error = %e, "failed to read version record");
        None
      }
    };

    if local.as_deref() == Some(server.as_str()) {
      debug!(%trigger, version = %server, "up to date");
      return Ok(Outcome::UpToDate(server));
    }

    if self.applied().as_deref() == Some(server.as_str()) {
      info!(version = %server, "version already applied in this session");
      return Ok(Outcome::AlreadyApplied(server));
    }

    info!(
      %trigger,
      from = local.as_deref().unwrap_or("none"),
      to = %server,
      "version drift detected, forcing update"
    );
    self.force_update(local.clone(), &server).await?;

    Ok(Outcome::Updated {
      from: local,
      to: server,
    })
  }

  /// Returns true when the shared last-check time is within the cooldown;
  /// otherwise records now as the last check.
  async fn cooling_down(&self) -> bool {
    let now = Utc::now();
    match self.versions.last_check().await {
      Ok(Some(last)) => {
        let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
        if elapsed < self.cooldown {
          return true;
        }
      }
      Ok(None) => {}
      Err(e) => warn!(error = %e, "failed to read last check time"),
    }

    if let Err(e) = self.versions.set_last_check(now).await {
      warn!(error = %e, "failed to record check time");
    }
    false
  }

  async fn force_update(&self, previous: Option<String>, version: &str) -> Result<()> {
    let removed = self.target.unregister_all().await?;
    info!(count = removed, "registrations removed");

    for tag in self.cache.list_generations().await? {
      self.cache.delete_generation(&tag).await?;
      info!(tag = %tag, "deleted generation");
    }

    if let Some(data) = &self.data {
      let cleared = data.clear().await?;
      info!(count = cleared, "data cache cleared");
    }

    self.versions.set_version(version).await?;

    if let Err(e) = self.target.register_fresh().await {
      error!(version, error = %e, "re-registration failed, restoring version record");
      let restored = match &previous {
        Some(v) => self.versions.set_version(v).await,
        None => self.versions.clear().await,
      };
      if let Err(re) = restored {
        warn!(error = %re, "failed to restore version record");
      }
      return Err(e);
    }

    self.set_applied(version);
    let notified = self.target.reload(version);
    info!(version, notified, "forced update complete, reload issued");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{Method, Response};
  use crate::net::testing::FakeNetwork;
  use crate::store::MemoryStore;
  use std::sync::atomic::AtomicUsize;

  struct FixedSource(Mutex<Option<String>>);

  impl FixedSource {
    fn new(v: Option<&str>) -> Arc<Self> {
      Arc::new(Self(Mutex::new(v.map(str::to_string))))
    }

    fn set(&self, v: &str) {
      *self.0.lock().unwrap() = Some(v.to_string());
    }
  }

  #[async_trait]
  impl VersionSource for FixedSource {
    async fn fetch_version(&self) -> Result<String> {
      self.0.lock().unwrap().clone().ok_or_else(|| eyre!("offline"))
    }
  }

  #[derive(Default)]
  struct RecordingTarget {
    unregistered: AtomicUsize,
    registered: AtomicUsize,
    reloads: Mutex<Vec<String>>,
    fail_register: AtomicBool,
    register_delay: Option<Duration>,
  }

  #[async_trait]
  impl UpdateTarget for RecordingTarget {
    async fn unregister_all(&self) -> Result<usize> {
      self.unregistered.fetch_add(1, Ordering::SeqCst);
      Ok(1)
    }

    async fn register_fresh(&self) -> Result<()> {
      if let Some(delay) = self.register_delay {
        tokio::time::sleep(delay).await;
      }
      if self.fail_register.load(Ordering::SeqCst) {
        return Err(eyre!("install failed"));
      }
      self.registered.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    fn reload(&self, version: &str) -> usize {
      self.reloads.lock().unwrap().push(version.to_string());
      1
    }
  }

  struct Setup {
    source: Arc<FixedSource>,
    store: Arc<MemoryStore>,
    target: Arc<RecordingTarget>,
    reconciler: Arc<Reconciler>,
  }

  fn setup(server: Option<&str>, target: RecordingTarget) -> Setup {
    let source = FixedSource::new(server);
    let store = Arc::new(MemoryStore::new());
    let target = Arc::new(target);
    let reconciler = Arc::new(
      Reconciler::new(
        source.clone(),
        store.clone(),
        store.clone(),
        target.clone(),
        Duration::from_secs(300),
      )
      .with_data_cache(DataCache::new(store.clone())),
    );
    Setup {
      source,
      store,
      target,
      reconciler,
    }
  }

  #[tokio::test]
  async fn test_drift_forces_update_and_reloads_once() {
    let s = setup(Some("2024121302"), RecordingTarget::default());
    s.store.set_version("2024121301").await.unwrap();
    s.store.open("crm-cache-v9").await.unwrap();
    s.store.open("crm-cache-v10").await.unwrap();

    let outcome = s.reconciler.check(Trigger::Poll).await.unwrap();
    assert_eq!(
      outcome,
      Outcome::Updated {
        from: Some("2024121301".to_string()),
        to: "2024121302".to_string(),
      }
    );
    assert!(s.store.list_generations().await.unwrap().is_empty());
    assert_eq!(s.store.get_version().await.unwrap().as_deref(), Some("2024121302"));
    assert_eq!(s.target.registered.load(Ordering::SeqCst), 1);

    let again = s.reconciler.check(Trigger::Poll).await.unwrap();
    assert_eq!(again, Outcome::UpToDate("2024121302".to_string()));
    assert_eq!(*s.target.reloads.lock().unwrap(), vec!["2024121302".to_string()]);
  }

  #[tokio::test]
  async fn test_drift_clears_data_cache() {
    let s = setup(Some("2024121302"), RecordingTarget::default());
    s.store.set_version("2024121301").await.unwrap();
    let data = DataCache::new(s.store.clone());
    let chats = Url::parse("https://crm.example.com/api/chats").unwrap();
    data.set(&chats, b"[]".to_vec()).await.unwrap();

    // Nothing is dropped while the versions agree
    s.source.set("2024121301");
    s.reconciler.check(Trigger::Poll).await.unwrap();
    assert!(data.get(&chats).await.unwrap().is_some());

    s.source.set("2024121302");
    s.reconciler.check(Trigger::Poll).await.unwrap();
    assert!(data.get(&chats).await.unwrap().is_none());
    assert_eq!(data.len().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_missing_record_counts_as_drift() {
    let s = setup(Some("2024121301"), RecordingTarget::default());

    let outcome = s.reconciler.check(Trigger::Activated).await.unwrap();
    assert!(matches!(outcome, Outcome::Updated { from: None, .. }));
  }

  #[tokio::test]
  async fn test_failed_check_changes_nothing() {
    let s = setup(None, RecordingTarget::default());
    s.store.set_version("2024121301").await.unwrap();
    s.store.open("crm-cache-v10").await.unwrap();

    assert_eq!(s.reconciler.check(Trigger::Poll).await.unwrap(), Outcome::CheckFailed);
    assert_eq!(s.store.get_version().await.unwrap().as_deref(), Some("2024121301"));
    assert_eq!(s.store.list_generations().await.unwrap().len(), 1);
    assert_eq!(s.target.unregistered.load(Ordering::SeqCst), 0);
    assert!(!s.reconciler.is_busy());
  }

  #[tokio::test]
  async fn test_register_failure_restores_version_and_clears_busy() {
    let target = RecordingTarget::default();
    target.fail_register.store(true, Ordering::SeqCst);
    let s = setup(Some("2024121302"), target);
    s.store.set_version("2024121301").await.unwrap();

    assert!(s.reconciler.check(Trigger::Poll).await.is_err());
    assert!(!s.reconciler.is_busy());
    assert_eq!(s.store.get_version().await.unwrap().as_deref(), Some("2024121301"));
    assert!(s.target.reloads.lock().unwrap().is_empty());

    // The next trigger tries again
    s.target.fail_register.store(false, Ordering::SeqCst);
    assert!(matches!(
      s.reconciler.check(Trigger::Poll).await.unwrap(),
      Outcome::Updated { .. }
    ));
  }

  #[tokio::test]
  async fn test_concurrent_trigger_is_busy() {
    let s = setup(
      Some("2024121302"),
      RecordingTarget {
        register_delay: Some(Duration::from_millis(50)),
        ..Default::default()
      },
    );

    let first = {
      let reconciler = s.reconciler.clone();
      tokio::spawn(async move { reconciler.check(Trigger::Poll).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(s.reconciler.check(Trigger::Visible).await.unwrap(), Outcome::Busy);
    assert!(matches!(first.await.unwrap().unwrap(), Outcome::Updated { .. }));
    assert_eq!(s.target.reloads.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_visibility_cooldown_is_shared() {
    let s = setup(Some("2024121301"), RecordingTarget::default());
    s.store.set_version("2024121301").await.unwrap();

    assert!(matches!(
      s.reconciler.check(Trigger::Visible).await.unwrap(),
      Outcome::UpToDate(_)
    ));
    assert_eq!(s.reconciler.check(Trigger::Visible).await.unwrap(), Outcome::CoolingDown);

    // Polls ignore the cooldown
    assert!(matches!(
      s.reconciler.check(Trigger::Poll).await.unwrap(),
      Outcome::UpToDate(_)
    ));

    // A check recorded by another instance long ago does not block
    s.store
      .set_last_check(Utc::now() - chrono::Duration::minutes(10))
      .await
      .unwrap();
    assert!(matches!(
      s.reconciler.check(Trigger::Visible).await.unwrap(),
      Outcome::UpToDate(_)
    ));
  }

  #[tokio::test]
  async fn test_applied_version_not_reapplied() {
    let s = setup(Some("2024121302"), RecordingTarget::default());
    s.store.set_version("2024121301").await.unwrap();
    s.reconciler.check(Trigger::Poll).await.unwrap();

    // Another instance still on the old build rewrites the record
    s.store.set_version("2024121301").await.unwrap();
    assert_eq!(
      s.reconciler.check(Trigger::Poll).await.unwrap(),
      Outcome::AlreadyApplied("2024121302".to_string())
    );
    assert_eq!(s.target.reloads.lock().unwrap().len(), 1);

    s.source.set("2024121303");
    assert!(matches!(
      s.reconciler.check(Trigger::Poll).await.unwrap(),
      Outcome::Updated { .. }
    ));
  }

  const VERSION_URL: &str = "https://crm.example.com/api/version";

  fn http_source(network: Arc<FakeNetwork>) -> HttpVersionSource {
    HttpVersionSource::new(network, Url::parse(VERSION_URL).unwrap(), Duration::from_secs(1))
  }

  #[tokio::test]
  async fn test_http_source_sends_no_cache() {
    let network = Arc::new(FakeNetwork::new());
    network.route(VERSION_URL, Response::ok(r#"{"version":"2024121302"}"#));

    let version = http_source(network.clone()).fetch_version().await.unwrap();
    assert_eq!(version, "2024121302");

    let request = &network.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.headers.get("cache-control").map(String::as_str), Some("no-cache"));
    assert_eq!(request.headers.get("pragma").map(String::as_str), Some("no-cache"));
  }

  #[tokio::test]
  async fn test_http_source_rejects_bad_answers() {
    for response in [
      Response::new(500, "boom"),
      Response::ok("<html>"),
      Response::ok(r#"{"version":""}"#),
      Response::ok(r#"{"build":"x"}"#),
    ] {
      let network = Arc::new(FakeNetwork::new());
      network.route(VERSION_URL, response);
      assert!(http_source(network).fetch_version().await.is_err());
    }
  }

  struct StalledNetwork;

  #[async_trait]
  impl Network for StalledNetwork {
    async fn fetch(&self, _request: &Request) -> Result<Response> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(Response::ok(r#"{"version":"late"}"#))
    }
  }

  #[tokio::test]
  async fn test_http_source_times_out() {
    let source = HttpVersionSource::new(
      Arc::new(StalledNetwork),
      Url::parse(VERSION_URL).unwrap(),
      Duration::from_millis(20),
    );
    assert!(source.fetch_version().await.is_err());
  }
}

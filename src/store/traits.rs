//! Storage traits shared by the worker, the reconciler and the offline queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::{Method, Request, RequestKey, Response};

/// A response held in a cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub response: Response,
  /// SHA-256 of the body, hex encoded. Bodies are stored once per digest.
  pub digest: String,
  pub cached_at: DateTime<Utc>,
}

impl StoredResponse {
  pub fn new(response: Response) -> Self {
    let digest = body_digest(&response.body);
    Self {
      response,
      digest,
      cached_at: Utc::now(),
    }
  }
}

/// Content address of a response body.
pub fn body_digest(body: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(body);
  hex::encode(hasher.finalize())
}

/// A deferred write captured while offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
  pub id: i64,
  pub method: Method,
  pub url: Url,
  pub body: Option<Vec<u8>>,
  pub queued_at: DateTime<Utc>,
}

impl PendingAction {
  pub fn to_request(&self) -> Request {
    let mut request = Request::new(self.method, self.url.clone());
    request.body = self.body.clone();
    request
  }
}

/// An API response body kept for offline reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
  /// Absolute request URL
  pub key: String,
  pub body: Vec<u8>,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl DataEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}

/// Generation-partitioned response cache.
///
/// Writes are idempotent replaces keyed by (generation, request key), so
/// concurrent writers resolve as last write wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
  /// Create the generation if it does not exist yet.
  async fn open(&self, tag: &str) -> Result<()>;

  async fn get(&self, tag: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Look the key up in every generation, most recently opened first.
  async fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store a response, opening the generation if needed.
  async fn put(&self, tag: &str, key: &RequestKey, response: &Response) -> Result<()>;

  async fn delete(&self, tag: &str, key: &RequestKey) -> Result<bool>;

  /// Generation tags, oldest first.
  async fn list_generations(&self) -> Result<Vec<String>>;

  async fn delete_generation(&self, tag: &str) -> Result<bool>;

  async fn entry_count(&self, tag: &str) -> Result<usize>;
}

/// Durable record of the last applied application version.
#[async_trait]
pub trait VersionStore: Send + Sync {
  async fn get_version(&self) -> Result<Option<String>>;

  async fn set_version(&self, version: &str) -> Result<()>;

  /// When any instance last ran a visibility-triggered check.
  async fn last_check(&self) -> Result<Option<DateTime<Utc>>>;

  async fn set_last_check(&self, at: DateTime<Utc>) -> Result<()>;

  /// Forget the version and the last check time.
  async fn clear(&self) -> Result<()>;
}

/// FIFO queue of writes waiting for the network.
#[async_trait]
pub trait QueueStore: Send + Sync {
  async fn push_action(&self, request: &Request) -> Result<PendingAction>;

  /// Pending actions in the order they were queued.
  async fn pending_actions(&self) -> Result<Vec<PendingAction>>;

  async fn remove_action(&self, id: i64) -> Result<()>;
}

/// Short-lived API data, independent of cache generations.
#[async_trait]
pub trait DataStore: Send + Sync {
  async fn get_data(&self, key: &str) -> Result<Option<DataEntry>>;

  /// Insert or replace the entry under its key.
  async fn put_data(&self, entry: &DataEntry) -> Result<()>;

  async fn remove_data(&self, key: &str) -> Result<bool>;

  /// Every entry, oldest first.
  async fn data_entries(&self) -> Result<Vec<DataEntry>>;

  /// Drop every entry, returning how many there were.
  async fn clear_data(&self) -> Result<usize>;
}

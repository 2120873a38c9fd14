//! Short-lived copies of API responses for offline reads.
//!
//! Entries expire after a fixed lifetime and the cache holds a bounded
//! number of them. Unlike cache generations they are not tied to a worker
//! version, but a forced update clears them with everything else.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::http::Response;
use crate::store::{DataEntry, DataStore};

pub const DEFAULT_MAX_ENTRIES: usize = 50;

#[derive(Clone)]
pub struct DataCache {
  store: Arc<dyn DataStore>,
  /// How long an entry may be served after it was stored
  ttl: Duration,
  max_entries: usize,
}

impl DataCache {
  pub fn new(store: Arc<dyn DataStore>) -> Self {
    Self {
      store,
      ttl: Duration::minutes(5),
      max_entries: DEFAULT_MAX_ENTRIES,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  pub fn with_max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = max_entries.max(1);
    self
  }

  /// The stored body replayed as a JSON response, unless missing or expired.
  /// Expired entries are removed on the way.
  pub async fn get(&self, url: &Url) -> Result<Option<Response>> {
    let Some(entry) = self.store.get_data(url.as_str()).await? else {
      return Ok(None);
    };

    if entry.is_expired(Utc::now()) {
      debug!(url = %url, "data entry expired");
      self.store.remove_data(&entry.key).await?;
      return Ok(None);
    }

    Ok(Some(
      Response::ok(entry.body).with_header("Content-Type", "application/json"),
    ))
  }

  /// Store a body, pruning first when the cache is full.
  pub async fn set(&self, url: &Url, body: Vec<u8>) -> Result<()> {
    if self.len().await? >= self.max_entries {
      self.prune().await?;
    }

    let now = Utc::now();
    self
      .store
      .put_data(&DataEntry {
        key: url.to_string(),
        body,
        stored_at: now,
        expires_at: now + self.ttl,
      })
      .await
  }

  /// Drop expired entries, then the oldest 30% if more than 70% of the
  /// capacity is still used. Returns how many entries were removed.
  pub async fn prune(&self) -> Result<usize> {
    let now = Utc::now();
    let (expired, live): (Vec<DataEntry>, Vec<DataEntry>) = self
      .store
      .data_entries()
      .await?
      .into_iter()
      .partition(|e| e.is_expired(now));

    let mut removed = 0;
    for entry in &expired {
      if self.store.remove_data(&entry.key).await? {
        removed += 1;
      }
    }

    if live.len() * 10 > self.max_entries * 7 {
      // Entries come oldest first
      for entry in live.iter().take(live.len() * 3 / 10) {
        if self.store.remove_data(&entry.key).await? {
          removed += 1;
        }
      }
    }

    debug!(removed, "data cache pruned");
    Ok(removed)
  }

  pub async fn clear(&self) -> Result<usize> {
    self.store.clear_data().await
  }

  pub async fn len(&self) -> Result<usize> {
    Ok(self.store.data_entries().await?.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::MemoryStore;

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://crm.example.com{}", path)).unwrap()
  }

  #[tokio::test]
  async fn test_hit_is_json_response() {
    let cache = DataCache::new(Arc::new(MemoryStore::new()));
    cache.set(&url("/api/chats"), br#"[{"id":3}]"#.to_vec()).await.unwrap();

    let hit = cache.get(&url("/api/chats")).await.unwrap().unwrap();
    assert_eq!(hit.status, 200);
    assert_eq!(hit.body, br#"[{"id":3}]"#);
    assert_eq!(hit.header("content-type"), Some("application/json"));
    assert!(cache.get(&url("/api/reminders")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_expired_entry_is_removed_on_read() {
    let store = Arc::new(MemoryStore::new());
    let cache = DataCache::new(store.clone());
    let past = Utc::now() - Duration::minutes(10);
    store
      .put_data(&DataEntry {
        key: url("/api/chats").to_string(),
        body: b"[]".to_vec(),
        stored_at: past,
        expires_at: past + Duration::minutes(5),
      })
      .await
      .unwrap();

    assert!(cache.get(&url("/api/chats")).await.unwrap().is_none());
    assert!(store.get_data(url("/api/chats").as_str()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_ttl_is_configurable() {
    let cache = DataCache::new(Arc::new(MemoryStore::new())).with_ttl(Duration::seconds(-1));
    cache.set(&url("/api/chats"), b"[]".to_vec()).await.unwrap();

    assert!(cache.get(&url("/api/chats")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_full_cache_drops_oldest_entries() {
    let cache = DataCache::new(Arc::new(MemoryStore::new())).with_max_entries(10);
    for i in 0..10 {
      cache.set(&url(&format!("/api/items/{}", i)), b"{}".to_vec()).await.unwrap();
    }
    assert_eq!(cache.len().await.unwrap(), 10);

    cache.set(&url("/api/items/10"), b"{}".to_vec()).await.unwrap();

    // 10 live entries is above 70% of capacity, so the oldest 3 go
    assert_eq!(cache.len().await.unwrap(), 8);
    for i in 0..3 {
      assert!(cache.get(&url(&format!("/api/items/{}", i))).await.unwrap().is_none());
    }
    assert!(cache.get(&url("/api/items/3")).await.unwrap().is_some());
    assert!(cache.get(&url("/api/items/10")).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_prune_prefers_expired_entries() {
    let store = Arc::new(MemoryStore::new());
    let cache = DataCache::new(store.clone()).with_max_entries(10);
    let past = Utc::now() - Duration::minutes(10);
    for i in 0..6 {
      store
        .put_data(&DataEntry {
          key: url(&format!("/api/old/{}", i)).to_string(),
          body: b"{}".to_vec(),
          stored_at: past,
          expires_at: past + Duration::minutes(5),
        })
        .await
        .unwrap();
    }
    for i in 0..4 {
      cache.set(&url(&format!("/api/new/{}", i)), b"{}".to_vec()).await.unwrap();
    }

    // Only 4 live entries remain after dropping the expired ones
    assert_eq!(cache.prune().await.unwrap(), 6);
    assert_eq!(cache.len().await.unwrap(), 4);
  }

  #[tokio::test]
  async fn test_clear_reports_removed() {
    let cache = DataCache::new(Arc::new(MemoryStore::new()));
    cache.set(&url("/api/chats"), b"[]".to_vec()).await.unwrap();
    cache.set(&url("/api/reminders"), b"[]".to_vec()).await.unwrap();

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert_eq!(cache.len().await.unwrap(), 0);
  }
}

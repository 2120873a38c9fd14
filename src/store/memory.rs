//! In-memory storage backend for ephemeral runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::traits::{
  CacheStore, DataEntry, DataStore, PendingAction, QueueStore, StoredResponse, VersionStore,
};
use crate::http::{Request, RequestKey, Response};

#[derive(Default)]
struct Inner {
  /// Generations in creation order
  generations: Vec<(String, BTreeMap<RequestKey, StoredResponse>)>,
  version: Option<String>,
  last_check: Option<DateTime<Utc>>,
  queue: Vec<PendingAction>,
  next_action_id: i64,
  /// API data in insertion order
  data: Vec<DataEntry>,
}

impl Inner {
  fn generation_mut(&mut self, tag: &str) -> &mut BTreeMap<RequestKey, StoredResponse> {
    let idx = match self.generations.iter().position(|(t, _)| t == tag) {
      Some(idx) => idx,
      None => {
        self.generations.push((tag.to_string(), BTreeMap::new()));
        self.generations.len() - 1
      }
    };
    &mut self.generations[idx].1
  }

  fn generation(&self, tag: &str) -> Option<&BTreeMap<RequestKey, StoredResponse>> {
    self
      .generations
      .iter()
      .find(|(t, _)| t == tag)
      .map(|(_, entries)| entries)
  }
}

/// Storage that lives as long as the process.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
    self.inner.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl CacheStore for MemoryStore {
  async fn open(&self, tag: &str) -> Result<()> {
    self.lock()?.generation_mut(tag);
    Ok(())
  }

  async fn get(&self, tag: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .lock()?
        .generation(tag)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  async fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .lock()?
        .generations
        .iter()
        .rev()
        .find_map(|(_, entries)| entries.get(key))
        .cloned(),
    )
  }

  async fn put(&self, tag: &str, key: &RequestKey, response: &Response) -> Result<()> {
    self
      .lock()?
      .generation_mut(tag)
      .insert(key.clone(), StoredResponse::new(response.clone()));
    Ok(())
  }

  async fn delete(&self, tag: &str, key: &RequestKey) -> Result<bool> {
    let mut inner = self.lock()?;
    Ok(
      inner
        .generations
        .iter_mut()
        .find(|(t, _)| t == tag)
        .map(|(_, entries)| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  async fn list_generations(&self) -> Result<Vec<String>> {
    Ok(
      self
        .lock()?
        .generations
        .iter()
        .map(|(tag, _)| tag.clone())
        .collect(),
    )
  }

  async fn delete_generation(&self, tag: &str) -> Result<bool> {
    let mut inner = self.lock()?;
    let before = inner.generations.len();
    inner.generations.retain(|(t, _)| t != tag);
    Ok(inner.generations.len() != before)
  }

  async fn entry_count(&self, tag: &str) -> Result<usize> {
    Ok(self.lock()?.generation(tag).map_or(0, BTreeMap::len))
  }
}

#[async_trait]
impl VersionStore for MemoryStore {
  async fn get_version(&self) -> Result<Option<String>> {
    Ok(self.lock()?.version.clone())
  }

  async fn set_version(&self, version: &str) -> Result<()> {
    self.lock()?.version = Some(version.to_string());
    Ok(())
  }

  async fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
    Ok(self.lock()?.last_check)
  }

  async fn set_last_check(&self, at: DateTime<Utc>) -> Result<()> {
    self.lock()?.last_check = Some(at);
    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    let mut inner = self.lock()?;
    inner.version = None;
    inner.last_check = None;
    Ok(())
  }
}

#[async_trait]
impl QueueStore for MemoryStore {
  async fn push_action(&self, request: &Request) -> Result<PendingAction> {
    let mut inner = self.lock()?;
    inner.next_action_id += 1;
    let action = PendingAction {
      id: inner.next_action_id,
      method: request.method,
      url: request.url.clone(),
      body: request.body.clone(),
      queued_at: Utc::now(),
    };
    inner.queue.push(action.clone());
    Ok(action)
  }

  async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    Ok(self.lock()?.queue.clone())
  }

  async fn remove_action(&self, id: i64) -> Result<()> {
    self.lock()?.queue.retain(|a| a.id != id);
    Ok(())
  }
}

#[async_trait]
impl DataStore for MemoryStore {
  async fn get_data(&self, key: &str) -> Result<Option<DataEntry>> {
    Ok(self.lock()?.data.iter().find(|e| e.key == key).cloned())
  }

  async fn put_data(&self, entry: &DataEntry) -> Result<()> {
    let mut inner = self.lock()?;
    inner.data.retain(|e| e.key != entry.key);
    inner.data.push(entry.clone());
    Ok(())
  }

  async fn remove_data(&self, key: &str) -> Result<bool> {
    let mut inner = self.lock()?;
    let before = inner.data.len();
    inner.data.retain(|e| e.key != key);
    Ok(inner.data.len() != before)
  }

  async fn data_entries(&self) -> Result<Vec<DataEntry>> {
    let mut entries = self.lock()?.data.clone();
    entries.sort_by_key(|e| e.stored_at);
    Ok(entries)
  }

  async fn clear_data(&self) -> Result<usize> {
    Ok(std::mem::take(&mut self.lock()?.data).len())
  }
}

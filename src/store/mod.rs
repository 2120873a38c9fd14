//! Client-durable storage: cache generations, the version record, the
//! pending action queue and short-lived API data.
//!
//! Every operation is async and fallible. Callers in the worker treat
//! failures as cache misses; nothing here is allowed to become fatal for a
//! request.

mod memory;
mod storage;
mod traits;

use color_eyre::Result;
use std::path::Path;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use storage::{NoopStore, SqliteStore};
pub use traits::{
  body_digest, CacheStore, DataEntry, DataStore, PendingAction, QueueStore, StoredResponse,
  VersionStore,
};

use crate::config::StorageKind;

/// The storage facets, usually backed by one object.
#[derive(Clone)]
pub struct Stores {
  pub cache: Arc<dyn CacheStore>,
  pub versions: Arc<dyn VersionStore>,
  pub queue: Arc<dyn QueueStore>,
  pub data: Arc<dyn DataStore>,
}

impl Stores {
  pub fn from_backend<S>(backend: S) -> Self
  where
    S: CacheStore + VersionStore + QueueStore + DataStore + 'static,
  {
    let backend = Arc::new(backend);
    Self {
      cache: backend.clone(),
      versions: backend.clone(),
      queue: backend.clone(),
      data: backend,
    }
  }

  /// Open the backend selected in configuration.
  pub fn open(kind: StorageKind, db_path: Option<&Path>) -> Result<Self> {
    Ok(match kind {
      StorageKind::Sqlite => Self::from_backend(SqliteStore::open(db_path)?),
      StorageKind::Memory => Self::from_backend(MemoryStore::new()),
      StorageKind::Disabled => Self::from_backend(NoopStore),
    })
  }

  pub fn memory() -> Self {
    Self::from_backend(MemoryStore::new())
  }
}

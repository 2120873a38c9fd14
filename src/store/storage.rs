//! SQLite storage backend and the no-op backend used when storage is disabled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use url::Url;

use super::traits::{
  body_digest, CacheStore, DataEntry, DataStore, PendingAction, QueueStore, StoredResponse,
  VersionStore,
};
use crate::http::{Headers, Request, RequestKey, Response};

const VERSION_KEY: &str = "swcache.version";
const LAST_CHECK_KEY: &str = "swcache.last_check";

/// Storage implementation that doesn't store anything.
/// Used when storage is disabled - writes are discarded and reads miss.
pub struct NoopStore;

#[async_trait]
impl CacheStore for NoopStore {
  async fn open(&self, _tag: &str) -> Result<()> {
    Ok(())
  }

  async fn get(&self, _tag: &str, _key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(None) // Always miss
  }

  async fn match_any(&self, _key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(None)
  }

  async fn put(&self, _tag: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  async fn delete(&self, _tag: &str, _key: &RequestKey) -> Result<bool> {
    Ok(false)
  }

  async fn list_generations(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  async fn delete_generation(&self, _tag: &str) -> Result<bool> {
    Ok(false)
  }

  async fn entry_count(&self, _tag: &str) -> Result<usize> {
    Ok(0)
  }
}

#[async_trait]
impl VersionStore for NoopStore {
  async fn get_version(&self) -> Result<Option<String>> {
    Ok(None)
  }

  async fn set_version(&self, _version: &str) -> Result<()> {
    Ok(())
  }

  async fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
    Ok(None)
  }

  async fn set_last_check(&self, _at: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  async fn clear(&self) -> Result<()> {
    Ok(())
  }
}

#[async_trait]
impl QueueStore for NoopStore {
  async fn push_action(&self, _request: &Request) -> Result<PendingAction> {
    Err(eyre!("Storage is disabled, cannot queue request"))
  }

  async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    Ok(Vec::new())
  }

  async fn remove_action(&self, _id: i64) -> Result<()> {
    Ok(())
  }
}

#[async_trait]
impl DataStore for NoopStore {
  async fn get_data(&self, _key: &str) -> Result<Option<DataEntry>> {
    Ok(None)
  }

  async fn put_data(&self, _entry: &DataEntry) -> Result<()> {
    Ok(())
  }

  async fn remove_data(&self, _key: &str) -> Result<bool> {
    Ok(false)
  }

  async fn data_entries(&self) -> Result<Vec<DataEntry>> {
    Ok(Vec::new())
  }

  async fn clear_data(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based storage implementation.
///
/// The connection is shared behind a mutex and every statement runs on the
/// blocking pool, so callers only ever see async operations.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open storage at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("swcache").join("store.db"))
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn)
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }

  async fn get_value(&self, key: &'static str) -> Result<Option<String>> {
    self
      .with_conn(move |conn| {
        conn
          .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
            row.get(0)
          })
          .optional()
          .map_err(|e| eyre!("Failed to read {}: {}", key, e))
      })
      .await
  }

  async fn set_value(&self, key: &'static str, value: String) -> Result<()> {
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
            params![key, value],
          )
          .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
        Ok(())
      })
      .await
  }
}

/// Schema for storage tables.
const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Cache generations, rowid gives creation order
CREATE TABLE IF NOT EXISTS generations (
    tag TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response bodies addressed by SHA-256 digest
CREATE TABLE IF NOT EXISTS bodies (
    digest TEXT PRIMARY KEY,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    tag TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (tag, request_key),
    FOREIGN KEY (tag) REFERENCES generations(tag) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(request_key);

-- Scalar client state (version record, last check)
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    body BLOB,
    queued_at TEXT NOT NULL
);

-- API data, times in milliseconds since the epoch
CREATE TABLE IF NOT EXISTS data_cache (
    key TEXT PRIMARY KEY,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

type EntryRow = (u16, String, String, Vec<u8>, String, String);

fn row_to_stored(row: EntryRow) -> Result<StoredResponse> {
  let (status, status_text, headers, body, digest, cached_at) = row;
  let headers: Headers =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to parse stored headers: {}", e))?;

  Ok(StoredResponse {
    response: Response {
      status,
      status_text,
      headers,
      body,
    },
    digest,
    cached_at: parse_datetime(&cached_at)?,
  })
}

fn read_entry(
  conn: &Connection,
  sql: &str,
  args: &[&dyn rusqlite::ToSql],
) -> Result<Option<StoredResponse>> {
  let row: Option<EntryRow> = conn
    .query_row(sql, args, |row| {
      Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
      ))
    })
    .optional()
    .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

  row.map(row_to_stored).transpose()
}

fn prune_bodies(conn: &Connection) -> Result<()> {
  conn
    .execute(
      "DELETE FROM bodies WHERE digest NOT IN (SELECT digest FROM entries)",
      [],
    )
    .map_err(|e| eyre!("Failed to prune response bodies: {}", e))?;
  Ok(())
}

#[async_trait]
impl CacheStore for SqliteStore {
  async fn open(&self, tag: &str) -> Result<()> {
    let tag = tag.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute("INSERT OR IGNORE INTO generations (tag) VALUES (?)", params![tag])
          .map_err(|e| eyre!("Failed to open generation {}: {}", tag, e))?;
        Ok(())
      })
      .await
  }

  async fn get(&self, tag: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let tag = tag.to_string();
    let key = key.as_str().to_string();
    self
      .with_conn(move |conn| {
        read_entry(
          conn,
          "SELECT e.status, e.status_text, e.headers, b.data, e.digest, e.cached_at
           FROM entries e INNER JOIN bodies b ON b.digest = e.digest
           WHERE e.tag = ? AND e.request_key = ?",
          params![tag, key],
        )
      })
      .await
  }

  async fn match_any(&self, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let key = key.as_str().to_string();
    self
      .with_conn(move |conn| {
        read_entry(
          conn,
          "SELECT e.status, e.status_text, e.headers, b.data, e.digest, e.cached_at
           FROM entries e
           INNER JOIN bodies b ON b.digest = e.digest
           INNER JOIN generations g ON g.tag = e.tag
           WHERE e.request_key = ?
           ORDER BY g.rowid DESC
           LIMIT 1",
          params![key],
        )
      })
      .await
  }

  async fn put(&self, tag: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let tag = tag.to_string();
    let key = key.as_str().to_string();
    let response = response.clone();

    self
      .with_conn(move |conn| {
        let digest = body_digest(&response.body);
        let headers = serde_json::to_string(&response.headers)
          .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
        let cached_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let tx = conn
          .unchecked_transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        tx.execute("INSERT OR IGNORE INTO generations (tag) VALUES (?)", params![tag])
          .map_err(|e| eyre!("Failed to open generation {}: {}", tag, e))?;

        tx.execute(
          "INSERT OR IGNORE INTO bodies (digest, data) VALUES (?, ?)",
          params![digest, response.body],
        )
        .map_err(|e| eyre!("Failed to store response body: {}", e))?;

        tx.execute(
          "INSERT OR REPLACE INTO entries (tag, request_key, status, status_text, headers, digest, cached_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)",
          params![tag, key, response.status, response.status_text, headers, digest, cached_at],
        )
        .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

        Ok(())
      })
      .await
  }

  async fn delete(&self, tag: &str, key: &RequestKey) -> Result<bool> {
    let tag = tag.to_string();
    let key = key.as_str().to_string();
    self
      .with_conn(move |conn| {
        let removed = conn
          .execute(
            "DELETE FROM entries WHERE tag = ? AND request_key = ?",
            params![tag, key],
          )
          .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
        prune_bodies(conn)?;
        Ok(removed > 0)
      })
      .await
  }

  async fn list_generations(&self) -> Result<Vec<String>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT tag FROM generations ORDER BY rowid")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let tags = stmt
          .query_map([], |row| row.get(0))
          .map_err(|e| eyre!("Failed to list generations: {}", e))?
          .collect::<rusqlite::Result<Vec<String>>>()
          .map_err(|e| eyre!("Failed to read generation: {}", e))?;

        Ok(tags)
      })
      .await
  }

  async fn delete_generation(&self, tag: &str) -> Result<bool> {
    let tag = tag.to_string();
    self
      .with_conn(move |conn| {
        // Entries go with the generation through ON DELETE CASCADE
        let removed = conn
          .execute("DELETE FROM generations WHERE tag = ?", params![tag])
          .map_err(|e| eyre!("Failed to delete generation {}: {}", tag, e))?;
        prune_bodies(conn)?;
        Ok(removed > 0)
      })
      .await
  }

  async fn entry_count(&self, tag: &str) -> Result<usize> {
    let tag = tag.to_string();
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT COUNT(*) FROM entries WHERE tag = ?",
            params![tag],
            |row| row.get::<_, i64>(0),
          )
          .map(|n| n as usize)
          .map_err(|e| eyre!("Failed to count entries: {}", e))
      })
      .await
  }
}

#[async_trait]
impl VersionStore for SqliteStore {
  async fn get_version(&self) -> Result<Option<String>> {
    self.get_value(VERSION_KEY).await
  }

  async fn set_version(&self, version: &str) -> Result<()> {
    self.set_value(VERSION_KEY, version.to_string()).await
  }

  async fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
    match self.get_value(LAST_CHECK_KEY).await? {
      Some(raw) => DateTime::parse_from_rfc3339(&raw)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|e| eyre!("Failed to parse last check time '{}': {}", raw, e)),
      None => Ok(None),
    }
  }

  async fn set_last_check(&self, at: DateTime<Utc>) -> Result<()> {
    self.set_value(LAST_CHECK_KEY, at.to_rfc3339()).await
  }

  async fn clear(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        conn
          .execute(
            "DELETE FROM kv WHERE key IN (?, ?)",
            params![VERSION_KEY, LAST_CHECK_KEY],
          )
          .map_err(|e| eyre!("Failed to clear version record: {}", e))?;
        Ok(())
      })
      .await
  }
}

#[async_trait]
impl QueueStore for SqliteStore {
  async fn push_action(&self, request: &Request) -> Result<PendingAction> {
    let method = request.method;
    let url = request.url.clone();
    let body = request.body.clone();
    let queued_at = Utc::now();

    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT INTO pending_actions (method, url, body, queued_at) VALUES (?, ?, ?, ?)",
            params![method.as_str(), url.as_str(), body, queued_at.to_rfc3339()],
          )
          .map_err(|e| eyre!("Failed to queue request: {}", e))?;

        Ok(PendingAction {
          id: conn.last_insert_rowid(),
          method,
          url,
          body,
          queued_at,
        })
      })
      .await
  }

  async fn pending_actions(&self) -> Result<Vec<PendingAction>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT id, method, url, body, queued_at FROM pending_actions ORDER BY id")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows = stmt
          .query_map([], |row| {
            Ok((
              row.get::<_, i64>(0)?,
              row.get::<_, String>(1)?,
              row.get::<_, String>(2)?,
              row.get::<_, Option<Vec<u8>>>(3)?,
              row.get::<_, String>(4)?,
            ))
          })
          .map_err(|e| eyre!("Failed to query pending actions: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read pending action: {}", e))?;

        rows
          .into_iter()
          .map(|(id, method, url, body, queued_at)| {
            Ok(PendingAction {
              id,
              method: method.parse()?,
              url: Url::parse(&url).map_err(|e| eyre!("Invalid queued URL '{}': {}", url, e))?,
              body,
              queued_at: DateTime::parse_from_rfc3339(&queued_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| eyre!("Failed to parse queue time '{}': {}", queued_at, e))?,
            })
          })
          .collect()
      })
      .await
  }

  async fn remove_action(&self, id: i64) -> Result<()> {
    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM pending_actions WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to remove pending action {}: {}", id, e))?;
        Ok(())
      })
      .await
  }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Timestamp out of range: {}", ms))
}

type DataRow = (String, Vec<u8>, i64, i64);

fn row_to_data(row: DataRow) -> Result<DataEntry> {
  let (key, body, stored_at, expires_at) = row;
  Ok(DataEntry {
    key,
    body,
    stored_at: millis_to_datetime(stored_at)?,
    expires_at: millis_to_datetime(expires_at)?,
  })
}

#[async_trait]
impl DataStore for SqliteStore {
  async fn get_data(&self, key: &str) -> Result<Option<DataEntry>> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        let row: Option<DataRow> = conn
          .query_row(
            "SELECT key, body, stored_at, expires_at FROM data_cache WHERE key = ?",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read data entry: {}", e))?;
        row.map(row_to_data).transpose()
      })
      .await
  }

  async fn put_data(&self, entry: &DataEntry) -> Result<()> {
    let entry = entry.clone();
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO data_cache (key, body, stored_at, expires_at) VALUES (?, ?, ?, ?)",
            params![
              entry.key,
              entry.body,
              entry.stored_at.timestamp_millis(),
              entry.expires_at.timestamp_millis()
            ],
          )
          .map_err(|e| eyre!("Failed to store data entry: {}", e))?;
        Ok(())
      })
      .await
  }

  async fn remove_data(&self, key: &str) -> Result<bool> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        let removed = conn
          .execute("DELETE FROM data_cache WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete data entry: {}", e))?;
        Ok(removed > 0)
      })
      .await
  }

  async fn data_entries(&self) -> Result<Vec<DataEntry>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT key, body, stored_at, expires_at FROM data_cache ORDER BY stored_at, rowid")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
          .map_err(|e| eyre!("Failed to query data entries: {}", e))?
          .collect::<rusqlite::Result<Vec<DataRow>>>()
          .map_err(|e| eyre!("Failed to read data entry: {}", e))?;

        rows.into_iter().map(row_to_data).collect()
      })
      .await
  }

  async fn clear_data(&self) -> Result<usize> {
    self
      .with_conn(|conn| {
        conn
          .execute("DELETE FROM data_cache", [])
          .map_err(|e| eyre!("Failed to clear data entries: {}", e))
      })
      .await
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;

  fn key(path: &str) -> RequestKey {
    RequestKey::new(Method::Get, &Url::parse(&format!("https://crm.example.com{}", path)).unwrap())
  }

  #[tokio::test]
  async fn test_put_then_get() {
    let store = SqliteStore::open_in_memory().unwrap();
    let resp = Response::ok("body{}").with_header("Content-Type", "text/css");

    store.put("crm-cache-v10", &key("/static/app.css"), &resp).await.unwrap();

    let stored = store
      .get("crm-cache-v10", &key("/static/app.css"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(stored.response, resp);
    assert_eq!(stored.digest, body_digest(b"body{}"));
    assert!(store.get("other", &key("/static/app.css")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_match_any_prefers_newest_generation() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("v1", &key("/"), &Response::ok("old")).await.unwrap();
    store.put("v2", &key("/"), &Response::ok("new")).await.unwrap();

    let hit = store.match_any(&key("/")).await.unwrap().unwrap();
    assert_eq!(hit.response.body, b"new");
  }

  #[tokio::test]
  async fn test_delete_generation_cascades_and_prunes() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("v1", &key("/a.js"), &Response::ok("a")).await.unwrap();
    store.put("v2", &key("/b.js"), &Response::ok("b")).await.unwrap();

    assert!(store.delete_generation("v1").await.unwrap());
    assert!(!store.delete_generation("v1").await.unwrap());

    assert_eq!(store.list_generations().await.unwrap(), vec!["v2".to_string()]);
    assert!(store.match_any(&key("/a.js")).await.unwrap().is_none());
    assert_eq!(store.entry_count("v2").await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_shared_body_survives_partial_delete() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.put("v1", &key("/same.js"), &Response::ok("same")).await.unwrap();
    store.put("v2", &key("/same.js"), &Response::ok("same")).await.unwrap();

    store.delete_generation("v1").await.unwrap();

    let hit = store.get("v2", &key("/same.js")).await.unwrap().unwrap();
    assert_eq!(hit.response.body, b"same");
  }

  #[tokio::test]
  async fn test_version_record_persists_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let store = SqliteStore::open(Some(&path)).unwrap();
      assert_eq!(store.get_version().await.unwrap(), None);
      store.set_version("2024121301").await.unwrap();
    }

    let store = SqliteStore::open(Some(&path)).unwrap();
    assert_eq!(store.get_version().await.unwrap().as_deref(), Some("2024121301"));

    store.clear().await.unwrap();
    assert_eq!(store.get_version().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_last_check_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let at = DateTime::parse_from_rfc3339("2024-12-13T09:00:00Z")
      .unwrap()
      .with_timezone(&Utc);

    store.set_last_check(at).await.unwrap();
    assert_eq!(store.last_check().await.unwrap(), Some(at));
  }

  #[tokio::test]
  async fn test_queue_is_fifo() {
    let store = SqliteStore::open_in_memory().unwrap();
    let origin = Url::parse("https://crm.example.com").unwrap();

    let first = Request::resolve(Method::Post, &origin, "/api/reminders").unwrap().with_body("a");
    let second = Request::resolve(Method::Put, &origin, "/api/chats/3").unwrap();

    let a = store.push_action(&first).await.unwrap();
    store.push_action(&second).await.unwrap();

    let pending = store.pending_actions().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].method, Method::Post);
    assert_eq!(pending[0].body.as_deref(), Some(&b"a"[..]));
    assert_eq!(pending[1].url.path(), "/api/chats/3");

    store.remove_action(a.id).await.unwrap();
    assert_eq!(store.pending_actions().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_data_entries_oldest_first() {
    let store = SqliteStore::open_in_memory().unwrap();
    let at = |s: &str| DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc);
    let entry = |key: &str, stored: &str| DataEntry {
      key: key.to_string(),
      body: b"[]".to_vec(),
      stored_at: at(stored),
      expires_at: at("2030-01-01T00:00:00Z"),
    };

    store.put_data(&entry("/api/b", "2024-12-13T09:00:02Z")).await.unwrap();
    store.put_data(&entry("/api/a", "2024-12-13T09:00:01Z")).await.unwrap();

    let keys: Vec<String> = store
      .data_entries()
      .await
      .unwrap()
      .into_iter()
      .map(|e| e.key)
      .collect();
    assert_eq!(keys, vec!["/api/a", "/api/b"]);

    let hit = store.get_data("/api/b").await.unwrap().unwrap();
    assert_eq!(hit.stored_at, at("2024-12-13T09:00:02Z"));

    assert!(store.remove_data("/api/b").await.unwrap());
    assert_eq!(store.clear_data().await.unwrap(), 1);
    assert!(store.get_data("/api/a").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_noop_store_always_misses() {
    let store = NoopStore;
    store.put("v1", &key("/"), &Response::ok("x")).await.unwrap();
    assert!(store.match_any(&key("/")).await.unwrap().is_none());
    assert!(store.list_generations().await.unwrap().is_empty());
  }
}

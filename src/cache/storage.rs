//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::types::CachedResponse;
use crate::error::StorageError;
use crate::queue::BUSY_TIMEOUT;

/// File name of the cache database inside the data directory.
pub const CACHE_DATABASE_FILE: &str = "cache.db";

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches (generations), each a map from
/// request key to response.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open_cache(&self, name: &str) -> Result<(), StorageError>;

  /// Names of all existing caches, in creation order.
  fn cache_names(&self) -> Result<Vec<String>, StorageError>;

  /// Delete a cache and its entries. Returns false if it did not exist.
  fn delete_cache(&self, name: &str) -> Result<bool, StorageError>;

  /// Store a single entry, replacing any previous one for the key.
  fn put(&self, name: &str, key: &str, response: &CachedResponse) -> Result<(), StorageError>;

  /// Store a set of entries atomically: either all are written or none.
  fn put_all(&self, name: &str, entries: &[(String, CachedResponse)]) -> Result<(), StorageError>;

  /// Find an entry for the key in any cache, searching in creation order.
  fn match_any(&self, key: &str) -> Result<Option<CachedResponse>, StorageError>;

  /// Number of entries in a cache.
  fn entry_count(&self, name: &str) -> Result<usize, StorageError>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!(
        "failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Self::with_connection(conn)
  }

  /// In-memory storage, gone when dropped.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named cache generations
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Cached responses, keyed by hashed request URL
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_key ON cache_entries(key_hash);
"#;

fn insert_entry(
  conn: &Connection,
  name: &str,
  key: &str,
  response: &CachedResponse,
) -> Result<(), StorageError> {
  let headers = serde_json::to_string(&response.headers)?;
  conn.execute(
    "INSERT OR REPLACE INTO cache_entries (cache_name, key_hash, request_url, status, headers, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
    params![name, key_hash(key), key, response.status, headers, response.body],
  )?;
  Ok(())
}

impl CacheStorage for SqliteCacheStorage {
  fn open_cache(&self, name: &str) -> Result<(), StorageError> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![name],
    )?;
    Ok(())
  }

  fn cache_names(&self) -> Result<Vec<String>, StorageError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY rowid")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool, StorageError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name],
    )?;
    let removed = tx.execute("DELETE FROM caches WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn put(&self, name: &str, key: &str, response: &CachedResponse) -> Result<(), StorageError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![name],
    )?;
    insert_entry(&tx, name, key, response)?;
    tx.commit()?;
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(String, CachedResponse)]) -> Result<(), StorageError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
      "INSERT OR IGNORE INTO caches (name) VALUES (?)",
      params![name],
    )?;
    for (key, response) in entries {
      insert_entry(&tx, name, key, response)?;
    }
    tx.commit()?;
    Ok(())
  }

  fn match_any(&self, key: &str) -> Result<Option<CachedResponse>, StorageError> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT e.status, e.headers, e.body, e.cached_at FROM cache_entries e
         INNER JOIN caches c ON c.name = e.cache_name
         WHERE e.key_hash = ? AND e.request_url = ?
         ORDER BY c.rowid
         LIMIT 1",
        params![key_hash(key), key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, cached_at)) => Ok(Some(CachedResponse {
        status,
        headers: serde_json::from_str(&headers)?,
        body,
        cached_at: parse_datetime(&cached_at),
      })),
      None => Ok(None),
    }
  }

  fn entry_count(&self, name: &str) -> Result<usize, StorageError> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
      params![name],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

/// SHA256 of the request key, for stable fixed-length primary keys.
fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(body: &str) -> CachedResponse {
    CachedResponse {
      status: 200,
      headers: vec![("content-type".to_string(), "text/plain".to_string())],
      body: body.as_bytes().to_vec(),
      cached_at: None,
    }
  }

  #[test]
  fn test_put_and_match() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    storage.put("dynamic-cache-v1", "http://o/items", &entry("a")).unwrap();

    let hit = storage.match_any("http://o/items").unwrap().unwrap();
    assert_eq!(hit.body, b"a");
    assert!(hit.cached_at.is_some());
    assert!(storage.match_any("http://o/other").unwrap().is_none());
  }

  #[test]
  fn test_match_prefers_older_cache() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    storage.open_cache("static-cache-v1").unwrap();
    storage.open_cache("dynamic-cache-v1").unwrap();
    storage.put("dynamic-cache-v1", "k", &entry("dynamic")).unwrap();
    storage.put("static-cache-v1", "k", &entry("static")).unwrap();

    assert_eq!(storage.match_any("k").unwrap().unwrap().body, b"static");
  }

  #[test]
  fn test_delete_cache_removes_entries() {
    let storage = SqliteCacheStorage::open_in_memory().unwrap();
    storage
      .put_all(
        "static-cache-v0",
        &[("a".to_string(), entry("a")), ("b".to_string(), entry("b"))],
      )
      .unwrap();
    assert_eq!(storage.entry_count("static-cache-v0").unwrap(), 2);

    assert!(storage.delete_cache("static-cache-v0").unwrap());
    assert!(!storage.delete_cache("static-cache-v0").unwrap());
    assert!(storage.cache_names().unwrap().is_empty());
    assert!(storage.match_any("a").unwrap().is_none());
  }

  #[test]
  fn test_write_waits_for_another_connection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CACHE_DATABASE_FILE);
    let storage = SqliteCacheStorage::open(&path).unwrap();

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
      let mut conn = Connection::open(&path).unwrap();
      let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .unwrap();
      tx.execute("INSERT INTO caches (name) VALUES ('held')", [])
        .unwrap();
      locked_tx.send(()).unwrap();
      std::thread::sleep(std::time::Duration::from_millis(300));
      tx.commit().unwrap();
    });

    locked_rx.recv().unwrap();
    storage.put("dynamic-cache-v1", "k", &entry("a")).unwrap();
    holder.join().unwrap();

    assert_eq!(
      storage.cache_names().unwrap(),
      vec!["held".to_string(), "dynamic-cache-v1".to_string()]
    );
  }
}

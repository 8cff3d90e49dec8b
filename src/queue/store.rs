use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::schema::{SCHEMA_V1, SCHEMA_VERSION};
use crate::error::StorageError;

/// How long a writer waits on a lock held by another connection.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A write that failed to reach the origin and waits for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWriteRecord {
  /// Assigned by the store; unique and increasing
  pub id: i64,
  /// Destination of the original write
  pub url: String,
  /// Parsed JSON payload of the original write
  pub body: Value,
  pub queued_at: DateTime<Utc>,
}

/// SQLite-backed queue of pending writes.
pub struct QueueStore {
  conn: Mutex<Connection>,
  upgraded: bool,
}

impl QueueStore {
  /// Open the queue database, creating its schema on first use.
  ///
  /// Opening an already-upgraded database is a no-op migration. The upgrade
  /// runs under an immediate transaction, so concurrent opens of the same
  /// file wait for each other and only one performs it.
  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StorageError::Unavailable(format!("failed to create queue directory: {}", e))
      })?;
    }

    let mut conn = Connection::open(path).map_err(|e| {
      StorageError::Unavailable(format!(
        "failed to open queue database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let upgraded = upgrade(&mut conn)?;
    if upgraded {
      info!(path = %path.display(), version = SCHEMA_VERSION, "created queue schema");
    }

    Ok(Self {
      conn: Mutex::new(conn),
      upgraded,
    })
  }

  /// Whether this open performed the schema upgrade.
  pub fn was_upgraded(&self) -> bool {
    self.upgraded
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {}", e)))
  }

  /// Queue a write. Returns the id assigned by the store.
  pub fn insert(&self, url: &str, payload: &Value) -> Result<i64, StorageError> {
    let body = serde_json::to_string(payload)?;
    let conn = self.conn()?;

    conn.execute(
      "INSERT INTO post_requests (url, body) VALUES (?1, ?2)",
      params![url, body],
    )?;
    let id = conn.last_insert_rowid();

    debug!(id, url, "queued pending write");
    Ok(id)
  }

  /// All pending writes, oldest first.
  pub fn list_all(&self) -> Result<Vec<PendingWriteRecord>, StorageError> {
    let conn = self.conn()?;

    let mut stmt =
      conn.prepare("SELECT id, url, body, queued_at FROM post_requests ORDER BY id")?;

    let rows: Vec<(i64, String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
      .collect::<Result<_, _>>()?;

    let records = rows
      .into_iter()
      .filter_map(|(id, url, body, queued_at)| {
        let body = match serde_json::from_str(&body) {
          Ok(body) => body,
          Err(e) => {
            warn!(id, error = %e, "skipping pending write with unreadable body");
            return None;
          }
        };
        Some(PendingWriteRecord {
          id,
          url,
          body,
          queued_at: parse_datetime(&queued_at),
        })
      })
      .collect();

    Ok(records)
  }

  /// Like [`list_all`](Self::list_all), but logs storage failures and
  /// degrades to an empty list.
  pub fn list_all_or_empty(&self) -> Vec<PendingWriteRecord> {
    self.list_all().unwrap_or_else(|e| {
      warn!(error = %e, "pending write queue unavailable, treating as empty");
      Vec::new()
    })
  }

  /// Remove a record. Deleting an id that is not present is a no-op.
  pub fn delete_by_id(&self, id: i64) -> Result<(), StorageError> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM post_requests WHERE id = ?1", params![id])?;
    Ok(())
  }

  pub fn count(&self) -> Result<usize, StorageError> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM post_requests", [], |row| row.get(0))?;
    Ok(count as usize)
  }
}

/// Bring the schema up to [`SCHEMA_VERSION`]. Returns true if anything ran.
fn upgrade(conn: &mut Connection) -> Result<bool, StorageError> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let version: i32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
  if version >= SCHEMA_VERSION {
    return Ok(false);
  }

  tx.execute_batch(SCHEMA_V1)?;
  tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
  tx.commit()?;

  Ok(true)
}

/// Parse a datetime string from SQLite format, falling back to now.
fn parse_datetime(s: &str) -> DateTime<Utc> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .unwrap_or_else(|_| Utc::now())
}

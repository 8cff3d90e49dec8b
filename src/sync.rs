//! Replay of queued writes after a reconnect.
//!
//! One pass takes a snapshot of the queue and replays every eligible record
//! as its own task. Tasks are independent: an error or panic in one replay
//! never cancels its siblings. A record is deleted only after the origin
//! answers with an OK status, and the client notification for it is sent
//! only after that delete succeeded.
//!
//! Records that fail stay queued. Each failure pushes the record's next
//! attempt back with capped exponential backoff; there is no attempt limit.

use futures::FutureExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BackoffConfig, SyncConfig};
use crate::error::{BodyError, StorageError, TransportError};
use crate::http::ProxyRequest;
use crate::notify::{ClientHub, Notification};
use crate::queue::{PendingWriteRecord, QueueStore};
use crate::transport::Transport;

/// Why a single record could not be replayed.
#[derive(Debug, Error)]
pub enum ReplayError {
  #[error("invalid destination '{0}'")]
  InvalidUrl(String),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("origin rejected replay with status {0}")]
  Rejected(StatusCode),

  #[error("replayed but could not remove from queue: {0}")]
  Storage(#[from] StorageError),

  #[error("replay task panicked")]
  Panicked,
}

impl From<BodyError> for ReplayError {
  fn from(e: BodyError) -> Self {
    Self::Transport(TransportError::Body(e))
  }
}

/// Result of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
  /// Replayed, deleted and announced
  pub replayed: Vec<i64>,
  /// Attempted and still queued
  pub failed: Vec<i64>,
  /// Skipped because their backoff window has not elapsed
  pub deferred: Vec<i64>,
}

impl SyncReport {
  pub fn is_empty(&self) -> bool {
    self.replayed.is_empty() && self.failed.is_empty() && self.deferred.is_empty()
  }
}

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
  failures: u32,
  not_before: Instant,
}

/// Per-record capped exponential backoff, kept in memory.
///
/// After the n-th consecutive failure a record waits `base * 2^(n-1)`,
/// capped at `max`, before it is attempted again.
#[derive(Debug)]
pub struct ReplayBackoff {
  enabled: bool,
  base: Duration,
  max: Duration,
  entries: HashMap<i64, BackoffEntry>,
}

impl ReplayBackoff {
  pub fn new(config: &BackoffConfig) -> Self {
    Self {
      enabled: config.enabled,
      base: Duration::from_secs(config.base_secs),
      max: Duration::from_secs(config.max_secs),
      entries: HashMap::new(),
    }
  }

  pub fn is_ready(&self, id: i64, now: Instant) -> bool {
    if !self.enabled {
      return true;
    }
    self
      .entries
      .get(&id)
      .map_or(true, |entry| now >= entry.not_before)
  }

  /// Record a failed attempt and return the delay before the next one.
  pub fn record_failure(&mut self, id: i64, now: Instant) -> Duration {
    let failures = self.entries.get(&id).map_or(0, |e| e.failures) + 1;
    let delay = self.delay_after(failures);
    self.entries.insert(
      id,
      BackoffEntry {
        failures,
        not_before: now + delay,
      },
    );
    delay
  }

  pub fn clear(&mut self, id: i64) {
    self.entries.remove(&id);
  }

  /// Earliest moment a backed-off record becomes eligible again.
  pub fn next_ready(&self) -> Option<Instant> {
    if !self.enabled {
      return None;
    }
    self.entries.values().map(|entry| entry.not_before).min()
  }

  /// Forget records that are no longer queued.
  fn retain(&mut self, queued: &[i64]) {
    self.entries.retain(|id, _| queued.contains(id));
  }

  fn delay_after(&self, failures: u32) -> Duration {
    if !self.enabled {
      return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    self.base.saturating_mul(factor).min(self.max)
  }
}

/// Drains the pending-write queue against the origin.
pub struct SyncAgent {
  queue: Arc<QueueStore>,
  transport: Arc<dyn Transport>,
  hub: ClientHub,
  replay_timeout: Duration,
  backoff: Mutex<ReplayBackoff>,
  /// Held for a whole pass so overlapping triggers never replay a record twice
  running: tokio::sync::Mutex<()>,
}

impl SyncAgent {
  pub fn new(
    queue: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
    hub: ClientHub,
    config: &SyncConfig,
  ) -> Self {
    Self {
      queue,
      transport,
      hub,
      replay_timeout: config.replay_timeout(),
      backoff: Mutex::new(ReplayBackoff::new(&config.backoff)),
      running: tokio::sync::Mutex::new(()),
    }
  }

  /// Run one synchronization pass.
  pub async fn run(&self) -> SyncReport {
    let _pass = self.running.lock().await;

    let records = self.queue.list_all_or_empty();
    let queued: Vec<i64> = records.iter().map(|r| r.id).collect();
    self.lock_backoff().retain(&queued);

    let mut report = SyncReport::default();
    if records.is_empty() {
      debug!("no pending writes to replay");
      return report;
    }

    let now = Instant::now();
    let mut tasks = JoinSet::new();
    {
      let backoff = self.lock_backoff();

      for record in records {
        if !backoff.is_ready(record.id, now) {
          report.deferred.push(record.id);
          continue;
        }
        let queue = Arc::clone(&self.queue);
        let transport = Arc::clone(&self.transport);
        let hub = self.hub.clone();
        let timeout = self.replay_timeout;
        let id = record.id;
        tasks.spawn(async move {
          let attempt = replay(record, queue.as_ref(), transport.as_ref(), &hub, timeout);
          let result = AssertUnwindSafe(attempt)
            .catch_unwind()
            .await
            .unwrap_or(Err(ReplayError::Panicked));
          (id, result)
        });
      }
    }

    info!(
      attempts = tasks.len(),
      deferred = report.deferred.len(),
      "replaying pending writes"
    );

    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((id, Ok(()))) => {
          self.lock_backoff().clear(id);
          report.replayed.push(id);
        }
        Ok((id, Err(e))) => {
          let delay = self.lock_backoff().record_failure(id, Instant::now());
          warn!(id, error = %e, retry_in = ?delay, "replay failed, record stays queued");
          report.failed.push(id);
        }
        Err(e) => warn!(error = %e, "replay task aborted"),
      }
    }

    report.replayed.sort_unstable();
    report.failed.sort_unstable();
    info!(
      replayed = report.replayed.len(),
      failed = report.failed.len(),
      "synchronization pass finished"
    );
    report
  }

  /// When the next backed-off record becomes eligible, if any.
  ///
  /// A reconnect trigger that lands inside a backoff window only defers the
  /// record, so callers schedule another pass for this moment.
  pub fn next_retry_at(&self) -> Option<Instant> {
    self.lock_backoff().next_ready()
  }

  fn lock_backoff(&self) -> std::sync::MutexGuard<'_, ReplayBackoff> {
    // The backoff map holds no invariants a panic could break.
    self
      .backoff
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Replay one record, then delete it, then announce it.
async fn replay(
  record: PendingWriteRecord,
  queue: &QueueStore,
  transport: &dyn Transport,
  hub: &ClientHub,
  timeout: Duration,
) -> Result<(), ReplayError> {
  let url = Url::parse(&record.url).map_err(|_| ReplayError::InvalidUrl(record.url.clone()))?;
  let request = ProxyRequest::post_json(url, &record.body)?;

  let response = tokio::time::timeout(timeout, transport.send(request))
    .await
    .map_err(|_| TransportError::TimedOut)??;

  if !response.is_ok() {
    return Err(ReplayError::Rejected(response.status));
  }

  queue.delete_by_id(record.id)?;
  let delivered = hub.broadcast(Notification::SyncCompleted { id: record.id });
  debug!(id = record.id, clients = delivered, "replayed pending write");
  Ok(())
}

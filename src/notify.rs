use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Message sent from the proxy to every connected client view.
///
/// Serialized as `{"type": "SYNC_COMPLETED", "id": 7}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
  /// A queued write was replayed and removed from the queue
  SyncCompleted { id: i64 },
}

/// Fan-out of notifications to all live client views.
///
/// Clients that subscribe after a notification was sent do not see it, and
/// a client that falls more than the channel capacity behind skips ahead.
#[derive(Clone)]
pub struct ClientHub {
  tx: broadcast::Sender<Notification>,
}

impl ClientHub {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.tx.subscribe()
  }

  /// Send to every subscriber. Returns how many received it.
  pub fn broadcast(&self, notification: Notification) -> usize {
    match self.tx.send(notification) {
      Ok(receivers) => receivers,
      Err(broadcast::error::SendError(notification)) => {
        debug!(?notification, "no client views connected");
        0
      }
    }
  }

  pub fn client_count(&self) -> usize {
    self.tx.receiver_count()
  }
}

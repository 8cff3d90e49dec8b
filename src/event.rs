use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::http::ProxyRequest;
use crate::pipeline::Outcome;
use crate::queue::PendingWriteRecord;
use crate::sync::SyncReport;

/// Events the proxy reacts to. Each variant is bound to one component in
/// [`Proxy::dispatch`](crate::proxy::Proxy::dispatch).
#[derive(Debug)]
pub enum ProxyEvent {
  /// Populate the static and immutable cache tiers
  Install,
  /// Purge stale cache generations
  Activate,
  /// An intercepted client request
  Fetch(ProxyRequest),
  /// Connectivity is likely back; replay the queue if the tag matches
  SyncTrigger { tag: String },
  /// A message posted by a client view
  Message(ClientMessage),
}

/// Messages a client view may post to the proxy.
///
/// Serialized as `{"type": "REGISTER_SYNC", "tag": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Ask for a replay under the given tag
  RegisterSync { tag: String },
  /// Ask for the writes still waiting in the queue
  ListPending,
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
  Installed,
  Activated { purged: Vec<String> },
  Fetched(Outcome),
  Synced(SyncReport),
  /// A sync trigger whose tag this proxy does not handle
  Ignored { tag: String },
  Pending(Vec<PendingWriteRecord>),
}

/// Queue of background events (lifecycle steps and reconnect triggers).
///
/// Fetch events are answered inline by the HTTP front and do not go through
/// this queue.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<ProxyEvent>,
  rx: mpsc::UnboundedReceiver<ProxyEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// A handle producers use to submit events.
  pub fn sender(&self) -> mpsc::UnboundedSender<ProxyEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<ProxyEvent> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

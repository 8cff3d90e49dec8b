//! Connectivity monitor.
//!
//! Periodically probes the origin and emits a reconnect trigger whenever the
//! origin becomes reachable after being unreachable (or on the first
//! successful probe after startup, to drain writes queued by an earlier run).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::event::ProxyEvent;
use crate::http::ProxyRequest;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  Online,
  Offline,
  Unknown,
}

impl NetworkStatus {
  /// Whether moving from `self` to `next` counts as a reconnect.
  pub fn is_reconnect(self, next: NetworkStatus) -> bool {
    next == NetworkStatus::Online && self != NetworkStatus::Online
  }
}

pub struct ConnectivityMonitor {
  transport: Arc<dyn Transport>,
  probe_url: Url,
  interval: Duration,
  tag: String,
  status: NetworkStatus,
}

impl ConnectivityMonitor {
  pub fn new(transport: Arc<dyn Transport>, probe_url: Url, interval: Duration, tag: String) -> Self {
    Self {
      transport,
      probe_url,
      interval,
      tag,
      status: NetworkStatus::Unknown,
    }
  }

  /// Any answer from the origin, even an error status, means it is reachable.
  pub async fn probe(&self) -> NetworkStatus {
    match self
      .transport
      .send(ProxyRequest::get(self.probe_url.clone()))
      .await
    {
      Ok(_) => NetworkStatus::Online,
      Err(e) if e.is_delivery_failure() => NetworkStatus::Offline,
      Err(_) => NetworkStatus::Unknown,
    }
  }

  /// Probe once and return the trigger to emit, if any.
  pub async fn check(&mut self) -> Option<ProxyEvent> {
    let next = self.probe().await;
    let previous = std::mem::replace(&mut self.status, next);

    if previous != next {
      info!(from = ?previous, to = ?next, "connectivity changed");
    }

    previous.is_reconnect(next).then(|| ProxyEvent::SyncTrigger {
      tag: self.tag.clone(),
    })
  }

  /// Run until the event receiver is gone.
  pub fn spawn(mut self, tx: mpsc::UnboundedSender<ProxyEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(self.interval);
      loop {
        ticker.tick().await;
        if let Some(event) = self.check().await {
          debug!("emitting reconnect trigger");
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    })
  }
}

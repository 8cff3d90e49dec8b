use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheTierManager, SqliteCacheStorage, CACHE_DATABASE_FILE};
use crate::config::Config;
use crate::error::ProxyError;
use crate::event::{ClientMessage, EventOutcome, ProxyEvent};
use crate::notify::ClientHub;
use crate::pipeline::Pipeline;
use crate::queue::{QueueStore, DATABASE_FILE};
use crate::recorder::DeferredWriteRecorder;
use crate::sync::{SyncAgent, SyncReport};
use crate::transport::{HttpTransport, Transport};

/// The background proxy: cache tiers, pipeline, queue and sync agent wired
/// together behind a single event entry point.
pub struct Proxy {
  cache: Arc<CacheTierManager<SqliteCacheStorage>>,
  pipeline: Pipeline<SqliteCacheStorage>,
  agent: SyncAgent,
  queue: Arc<QueueStore>,
  hub: ClientHub,
  transport: Arc<dyn Transport>,
  origin: Url,
  sync_tag: String,
  retry: Option<RetryTimer>,
}

impl Proxy {
  /// Open both databases under `data_dir` and talk to the origin over HTTP.
  pub fn open(config: &Config, data_dir: &Path) -> Result<Self, ProxyError> {
    let queue = QueueStore::open(&data_dir.join(DATABASE_FILE))?;
    let cache = SqliteCacheStorage::open(&data_dir.join(CACHE_DATABASE_FILE))?;
    let transport = HttpTransport::new(config.network.timeout())?;

    Ok(Self::new(config, Arc::new(queue), cache, Arc::new(transport)))
  }

  pub fn new(
    config: &Config,
    queue: Arc<QueueStore>,
    cache_storage: SqliteCacheStorage,
    transport: Arc<dyn Transport>,
  ) -> Self {
    let hub = ClientHub::new(config.sync.notification_capacity);
    let cache = Arc::new(CacheTierManager::new(
      cache_storage,
      config.cache.clone(),
      config.origin.clone(),
    ));
    let pipeline = Pipeline::new(
      Arc::clone(&cache),
      Arc::clone(&transport),
      DeferredWriteRecorder::new(Arc::clone(&queue)),
    );
    let agent = SyncAgent::new(
      Arc::clone(&queue),
      Arc::clone(&transport),
      hub.clone(),
      &config.sync,
    );

    Self {
      cache,
      pipeline,
      agent,
      queue,
      hub,
      transport,
      origin: config.origin.clone(),
      sync_tag: config.sync.tag.clone(),
      retry: None,
    }
  }

  /// Send a sync trigger on `tx` whenever backed-off records become
  /// eligible for replay again.
  pub fn with_retries(mut self, tx: mpsc::UnboundedSender<ProxyEvent>) -> Self {
    self.retry = Some(RetryTimer::new(tx));
    self
  }

  /// Handle one event with the component bound to it.
  pub async fn dispatch(&self, event: ProxyEvent) -> Result<EventOutcome, ProxyError> {
    match event {
      ProxyEvent::Install => {
        self.cache.install(self.transport.as_ref()).await?;
        Ok(EventOutcome::Installed)
      }
      ProxyEvent::Activate => {
        let purged = self.cache.activate()?;
        Ok(EventOutcome::Activated { purged })
      }
      ProxyEvent::Fetch(request) => Ok(EventOutcome::Fetched(self.pipeline.handle(request).await?)),
      ProxyEvent::SyncTrigger { tag } => Ok(self.on_sync_trigger(tag).await),
      ProxyEvent::Message(ClientMessage::RegisterSync { tag }) => {
        debug!(tag = %tag, "client registered a sync");
        Ok(self.on_sync_trigger(tag).await)
      }
      ProxyEvent::Message(ClientMessage::ListPending) => {
        Ok(EventOutcome::Pending(self.queue.list_all_or_empty()))
      }
    }
  }

  async fn on_sync_trigger(&self, tag: String) -> EventOutcome {
    if tag != self.sync_tag {
      debug!(tag = %tag, "ignoring sync trigger with unknown tag");
      return EventOutcome::Ignored { tag };
    }
    info!(tag = %tag, "reconnect trigger received");
    EventOutcome::Synced(self.sync().await)
  }

  /// Replay the queue now, regardless of tag.
  pub async fn sync(&self) -> SyncReport {
    let report = self.agent.run().await;
    if let (Some(retry), Some(at)) = (&self.retry, self.agent.next_retry_at()) {
      retry.arm(at, &self.sync_tag);
    }
    report
  }

  pub fn hub(&self) -> &ClientHub {
    &self.hub
  }

  pub fn queue(&self) -> &QueueStore {
    &self.queue
  }

  pub fn transport(&self) -> Arc<dyn Transport> {
    Arc::clone(&self.transport)
  }

  pub fn sync_tag(&self) -> &str {
    &self.sync_tag
  }

  /// Map a path and query seen by the proxy onto the origin. Paths that
  /// would resolve to another host (`//elsewhere/...`) are rejected.
  pub fn origin_url(&self, path_and_query: &str) -> Result<Url, url::ParseError> {
    let url = self.origin.join(path_and_query)?;
    if url.origin() != self.origin.origin() {
      return Err(url::ParseError::InvalidDomainCharacter);
    }
    Ok(url)
  }
}

/// Fires one sync trigger at the earliest pending retry deadline.
struct RetryTimer {
  tx: mpsc::UnboundedSender<ProxyEvent>,
  armed: Arc<Mutex<Option<Instant>>>,
}

impl RetryTimer {
  fn new(tx: mpsc::UnboundedSender<ProxyEvent>) -> Self {
    Self {
      tx,
      armed: Arc::new(Mutex::new(None)),
    }
  }

  fn arm(&self, at: Instant, tag: &str) {
    {
      let mut armed = self.armed.lock().unwrap_or_else(|p| p.into_inner());
      if armed.is_some_and(|current| current <= at) {
        return;
      }
      *armed = Some(at);
    }

    let tx = self.tx.clone();
    let armed = Arc::clone(&self.armed);
    let tag = tag.to_string();
    tokio::spawn(async move {
      tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
      {
        let mut current = armed.lock().unwrap_or_else(|p| p.into_inner());
        if *current == Some(at) {
          *current = None;
        }
      }
      debug!(tag = %tag, "backoff elapsed, retrying sync");
      let _ = tx.send(ProxyEvent::SyncTrigger { tag });
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStorage;
  use crate::config::{BackoffConfig, CacheConfig, SYNC_TAG};
  use crate::event::EventHandler;
  use crate::http::ProxyRequest;
  use crate::notify::Notification;
  use crate::pipeline::Outcome;
  use crate::testing::{origin, FakeTransport};
  use reqwest::{Method, StatusCode};
  use serde_json::json;
  use std::time::Duration;

  fn config() -> Config {
    let mut config = Config {
      origin: origin(),
      ..Config::default()
    };
    config.sync.backoff = BackoffConfig {
      enabled: false,
      ..BackoffConfig::default()
    };
    config.cache = CacheConfig {
      version: "v2".to_string(),
      static_files: vec!["/pages/offline.html".to_string()],
      immutable_files: Vec::new(),
      ..CacheConfig::default()
    };
    config
  }

  fn proxy() -> (tempfile::TempDir, Arc<FakeTransport>, Proxy) {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new());
    let queue = Arc::new(QueueStore::open(&dir.path().join(DATABASE_FILE)).unwrap());
    let proxy = Proxy::new(
      &config(),
      queue,
      SqliteCacheStorage::open_in_memory().unwrap(),
      transport.clone(),
    );
    (dir, transport, proxy)
  }

  #[tokio::test]
  async fn test_offline_write_then_reconnect() {
    let (_dir, transport, proxy) = proxy();
    let mut client = proxy.hub().subscribe();
    let items = origin().join("/items").unwrap();

    transport.set_online(false);
    let request = ProxyRequest::post_json(
      items.clone(),
      &json!({"name": "X", "director": "Y", "rating": "PG"}),
    )
    .unwrap();
    let outcome = proxy.dispatch(ProxyEvent::Fetch(request)).await.unwrap();
    let EventOutcome::Fetched(Outcome::QueuedLocally { id, .. }) = outcome else {
      panic!("expected the write to be queued");
    };
    assert_eq!(proxy.queue().count().unwrap(), 1);

    transport.set_online(true);
    transport.route(Method::POST, items.as_str(), StatusCode::OK, "{}");
    let outcome = proxy
      .dispatch(ProxyEvent::SyncTrigger {
        tag: SYNC_TAG.to_string(),
      })
      .await
      .unwrap();

    assert!(matches!(outcome, EventOutcome::Synced(ref r) if r.replayed == vec![id]));
    assert_eq!(proxy.queue().count().unwrap(), 0);
    assert_eq!(client.recv().await.unwrap(), Notification::SyncCompleted { id });
    assert!(client.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_deferred_record_is_retried_once_eligible() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new());
    let queue = Arc::new(QueueStore::open(&dir.path().join(DATABASE_FILE)).unwrap());
    let mut config = config();
    config.sync.backoff = BackoffConfig {
      enabled: true,
      base_secs: 1,
      max_secs: 1,
    };
    let mut events = EventHandler::new();
    let proxy = Proxy::new(
      &config,
      queue,
      SqliteCacheStorage::open_in_memory().unwrap(),
      transport.clone(),
    )
    .with_retries(events.sender());
    let items = "http://origin.test/items";
    let id = proxy.queue().insert(items, &json!({"name": "X"})).unwrap();

    transport.set_online(false);
    assert_eq!(proxy.sync().await.failed, vec![id]);

    // The reconnect lands inside the backoff window.
    transport.set_online(true);
    transport.route(Method::POST, items, StatusCode::CREATED, "");
    let outcome = proxy
      .dispatch(ProxyEvent::SyncTrigger {
        tag: SYNC_TAG.to_string(),
      })
      .await
      .unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(ref r) if r.deferred == vec![id]));
    assert_eq!(proxy.queue().count().unwrap(), 1);

    let retry = tokio::time::timeout(Duration::from_secs(5), events.next())
      .await
      .unwrap()
      .unwrap();
    assert!(matches!(retry, ProxyEvent::SyncTrigger { ref tag } if tag == SYNC_TAG));

    let outcome = proxy.dispatch(retry).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Synced(ref r) if r.replayed == vec![id]));
    assert_eq!(proxy.queue().count().unwrap(), 0);
  }

  #[test]
  fn test_origin_url_stays_on_origin() {
    let (_dir, _transport, proxy) = proxy();
    assert_eq!(
      proxy.origin_url("/items?page=2").unwrap().as_str(),
      "http://origin.test/items?page=2"
    );
    assert!(proxy.origin_url("//elsewhere.test/items").is_err());
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let (_dir, transport, proxy) = proxy();
    proxy.queue().insert("http://origin.test/items", &json!({})).unwrap();

    let outcome = proxy
      .dispatch(ProxyEvent::SyncTrigger {
        tag: "something-else".to_string(),
      })
      .await
      .unwrap();

    assert!(matches!(outcome, EventOutcome::Ignored { .. }));
    assert_eq!(transport.call_count(), 0);
    assert_eq!(proxy.queue().count().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_register_sync_message_replays() {
    let (_dir, transport, proxy) = proxy();
    proxy.queue().insert("http://origin.test/items", &json!({})).unwrap();
    transport.route(Method::POST, "http://origin.test/items", StatusCode::CREATED, "");

    let outcome = proxy
      .dispatch(ProxyEvent::Message(ClientMessage::RegisterSync {
        tag: SYNC_TAG.to_string(),
      }))
      .await
      .unwrap();

    assert!(matches!(outcome, EventOutcome::Synced(ref r) if r.replayed.len() == 1));
    assert_eq!(proxy.queue().count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_list_pending_message() {
    let (_dir, _transport, proxy) = proxy();
    let id = proxy.queue().insert("http://origin.test/items", &json!({"name": "X"})).unwrap();

    let outcome = proxy
      .dispatch(ProxyEvent::Message(ClientMessage::ListPending))
      .await
      .unwrap();

    let EventOutcome::Pending(records) = outcome else {
      panic!("expected pending records");
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
  }

  #[tokio::test]
  async fn test_install_then_activate_then_offline_page() {
    let (_dir, transport, proxy) = proxy();
    transport.route(
      Method::GET,
      "http://origin.test/pages/offline.html",
      StatusCode::OK,
      "<html>offline</html>",
    );
    proxy.cache.storage().open_cache("static-cache-v1").unwrap();

    assert!(matches!(
      proxy.dispatch(ProxyEvent::Install).await.unwrap(),
      EventOutcome::Installed
    ));
    let outcome = proxy.dispatch(ProxyEvent::Activate).await.unwrap();
    assert!(
      matches!(outcome, EventOutcome::Activated { ref purged } if purged == &vec!["static-cache-v1".to_string()])
    );

    transport.set_online(false);
    let request = ProxyRequest::get(origin().join("/pages/recent.html").unwrap()).with_accept("text/html");
    let outcome = proxy.dispatch(ProxyEvent::Fetch(request)).await.unwrap();
    assert!(matches!(outcome, EventOutcome::Fetched(Outcome::Fallback(_))));
  }
}

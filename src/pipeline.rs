//! Per-request routing between the cache tiers, the origin, and the
//! deferred-write queue.
//!
//! - POST: send a duplicate to the origin; if delivery fails, queue the
//!   untouched copy and answer with a synthetic acknowledgment.
//! - GET: cache first, then network (populating the dynamic tier), then a
//!   fallback asset chosen by the Accept header.
//! - Anything else passes straight through.

use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, CacheTierManager, CachedResponse, Fallback, Tier};
use crate::error::{ProxyError, TransportError};
use crate::http::{ProxyRequest, ProxyResponse};
use crate::recorder::DeferredWriteRecorder;
use crate::transport::Transport;

/// How a request was answered.
#[derive(Debug)]
pub enum Outcome {
  /// The origin answered (any status)
  Delivered(ProxyResponse),
  /// Served from a cache tier without touching the network
  Cached(ProxyResponse),
  /// Cache and network both missed; a named fallback asset was served
  Fallback(ProxyResponse),
  /// The write could not be delivered and waits in the queue under `id`
  QueuedLocally { id: i64, response: ProxyResponse },
}

impl Outcome {
  pub fn response(&self) -> &ProxyResponse {
    match self {
      Outcome::Delivered(r) | Outcome::Cached(r) | Outcome::Fallback(r) => r,
      Outcome::QueuedLocally { response, .. } => response,
    }
  }

  pub fn into_response(self) -> ProxyResponse {
    match self {
      Outcome::Delivered(r) | Outcome::Cached(r) | Outcome::Fallback(r) => r,
      Outcome::QueuedLocally { response, .. } => response,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, Outcome::QueuedLocally { .. })
  }
}

pub struct Pipeline<S: CacheStorage + 'static> {
  cache: Arc<CacheTierManager<S>>,
  transport: Arc<dyn Transport>,
  recorder: DeferredWriteRecorder,
}

impl<S: CacheStorage + 'static> Pipeline<S> {
  pub fn new(
    cache: Arc<CacheTierManager<S>>,
    transport: Arc<dyn Transport>,
    recorder: DeferredWriteRecorder,
  ) -> Self {
    Self {
      cache,
      transport,
      recorder,
    }
  }

  pub async fn handle(&self, request: ProxyRequest) -> Result<Outcome, ProxyError> {
    debug!(method = %request.method, url = %request.url, "intercepted request");

    match request.method {
      Method::POST => self.handle_write(request).await,
      Method::GET => self.handle_read(request).await,
      _ => Ok(Outcome::Delivered(self.transport.send(request).await?)),
    }
  }

  async fn handle_write(&self, request: ProxyRequest) -> Result<Outcome, ProxyError> {
    // Sending consumes the body, so the copy must be taken first.
    let duplicate = request.duplicate()?;

    match self.transport.send(request).await {
      Ok(response) => Ok(Outcome::Delivered(response)),
      Err(err) if err.is_delivery_failure() => {
        warn!(url = %duplicate.url, error = %err, "write not delivered, queueing");
        self.recorder.record_failed_write(duplicate)
      }
      Err(err) => Err(err.into()),
    }
  }

  async fn handle_read(&self, request: ProxyRequest) -> Result<Outcome, ProxyError> {
    match self.cache.lookup(&request) {
      Ok(Some(hit)) => return Ok(Outcome::Cached(hit.to_response())),
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "cache lookup failed, treating as miss"),
    }

    let key = request.cache_key();
    let fallback = if request.accepts("text/html") {
      Some(Fallback::OfflinePage)
    } else if request.accepts("image") {
      Some(Fallback::ErrorImage)
    } else {
      None
    };

    match self.transport.send(request).await {
      Ok(response) => {
        self.populate_dynamic(key, &response);
        Ok(Outcome::Delivered(response))
      }
      Err(err) if err.is_delivery_failure() => self.serve_fallback(fallback, err),
      Err(err) => Err(err.into()),
    }
  }

  /// Store a copy of a fetched response in the dynamic tier in the
  /// background, whatever its status. Partial content is never stored.
  /// Failures are logged and never reach the caller.
  fn populate_dynamic(&self, key: String, response: &ProxyResponse) {
    if response.status == StatusCode::PARTIAL_CONTENT {
      return;
    }
    let copy = match response.duplicate() {
      Ok(copy) => copy,
      Err(e) => {
        warn!(key = %key, error = %e, "cannot copy response for caching");
        return;
      }
    };

    let cache = Arc::clone(&self.cache);
    tokio::spawn(async move {
      let stored = CachedResponse::capture(copy)
        .map_err(ProxyError::from)
        .and_then(|cached| Ok(cache.store(Tier::Dynamic, &key, &cached)?));
      if let Err(e) = stored {
        warn!(key = %key, error = %e, "failed to cache response");
      }
    });
  }

  fn serve_fallback(
    &self,
    fallback: Option<Fallback>,
    err: TransportError,
  ) -> Result<Outcome, ProxyError> {
    let Some(kind) = fallback else {
      return Err(err.into());
    };

    match self.cache.fallback(kind) {
      Ok(Some(asset)) => {
        debug!(?kind, "serving fallback asset");
        Ok(Outcome::Fallback(asset.to_response()))
      }
      Ok(None) => {
        warn!(?kind, "fallback asset not cached");
        Err(err.into())
      }
      Err(e) => {
        warn!(?kind, error = %e, "fallback lookup failed");
        Err(err.into())
      }
    }
  }
}

use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::ProxyError;
use crate::http::{ProxyRequest, ProxyResponse};
use crate::pipeline::Outcome;
use crate::queue::QueueStore;

/// Message returned to the caller when a write was queued instead of sent.
pub const QUEUED_MESSAGE: &str = "Saved locally. Synchronization pending.";

/// Header carrying the queue id on a queued-locally acknowledgment.
pub const QUEUED_ID_HEADER: &str = "x-catalog-queued-id";

/// Persists writes that failed delivery so they can be replayed later.
#[derive(Clone)]
pub struct DeferredWriteRecorder {
  queue: Arc<QueueStore>,
}

impl DeferredWriteRecorder {
  pub fn new(queue: Arc<QueueStore>) -> Self {
    Self { queue }
  }

  /// Queue the request and build a synthetic acknowledgment.
  ///
  /// Reads the request body exactly once. The acknowledgment has status 200
  /// like a real success, so the queue id is also carried in
  /// [`QUEUED_ID_HEADER`] and the returned [`Outcome`] is tagged.
  pub fn record_failed_write(&self, mut request: ProxyRequest) -> Result<Outcome, ProxyError> {
    let payload: Value = request.take_json()?;
    let id = self.queue.insert(request.url.as_str(), &payload)?;
    info!(id, url = %request.url, "write queued for replay");

    let mut response = ProxyResponse::json(StatusCode::OK, &json!({ "message": QUEUED_MESSAGE }))?;
    response
      .headers
      .insert(QUEUED_ID_HEADER, HeaderValue::from(id));

    Ok(Outcome::QueuedLocally { id, response })
  }
}

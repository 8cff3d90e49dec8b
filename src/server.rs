//! HTTP front of the proxy.
//!
//! Every request outside `/__proxy/` is turned into a fetch event against
//! the origin. The control routes are:
//! - `GET  /__proxy/events`   server-sent stream of client notifications
//! - `POST /__proxy/messages` post a [`ClientMessage`]
//! - `GET  /__proxy/pending`  writes still waiting in the queue
//! - `POST /__proxy/sync`     replay the queue now

use axum::body::{to_bytes, Body as AxumBody};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, StorageError};
use crate::event::{ClientMessage, EventOutcome, ProxyEvent};
use crate::http::{strip_hop_by_hop, Body, ProxyRequest, ProxyResponse};
use crate::proxy::Proxy;

/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
  proxy: Arc<Proxy>,
}

pub fn router(proxy: Arc<Proxy>) -> Router {
  Router::new()
    .route("/__proxy/events", get(events))
    .route("/__proxy/messages", post(message))
    .route("/__proxy/pending", get(pending))
    .route("/__proxy/sync", post(sync_now))
    .fallback(intercept)
    .with_state(AppState { proxy })
}

/// Bind `listen` and serve until the process exits.
pub async fn serve(proxy: Arc<Proxy>, listen: SocketAddr) -> std::io::Result<()> {
  let listener = tokio::net::TcpListener::bind(listen).await?;
  info!(addr = %listener.local_addr()?, "proxy listening");
  axum::serve(listener, router(proxy)).await
}

async fn intercept(State(state): State<AppState>, request: Request) -> Response {
  let (parts, body) = request.into_parts();

  let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(bytes) => bytes,
    Err(e) => return error_body(StatusCode::BAD_REQUEST, &e.to_string()),
  };

  let path = parts
    .uri
    .path_and_query()
    .map(|p| p.as_str())
    .unwrap_or("/");
  let url = match state.proxy.origin_url(path) {
    Ok(url) => url,
    Err(e) => return error_body(StatusCode::BAD_REQUEST, &e.to_string()),
  };

  let mut headers = parts.headers;
  strip_hop_by_hop(&mut headers);
  let request = ProxyRequest::new(parts.method, url, headers, Body::new(bytes.to_vec()));

  dispatch(&state, ProxyEvent::Fetch(request)).await
}

async fn message(State(state): State<AppState>, Json(message): Json<ClientMessage>) -> Response {
  dispatch(&state, ProxyEvent::Message(message)).await
}

async fn pending(State(state): State<AppState>) -> Response {
  dispatch(&state, ProxyEvent::Message(ClientMessage::ListPending)).await
}

async fn sync_now(State(state): State<AppState>) -> Response {
  let tag = state.proxy.sync_tag().to_string();
  dispatch(&state, ProxyEvent::SyncTrigger { tag }).await
}

async fn events(
  State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
  let rx = state.proxy.hub().subscribe();
  debug!(clients = state.proxy.hub().client_count(), "client view connected");

  let stream = stream::unfold(rx, |mut rx| async move {
    loop {
      match rx.recv().await {
        Ok(notification) => return Some((Event::default().json_data(&notification), rx)),
        Err(RecvError::Lagged(skipped)) => {
          warn!(skipped, "client view fell behind, notifications dropped");
        }
        Err(RecvError::Closed) => return None,
      }
    }
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn dispatch(state: &AppState, event: ProxyEvent) -> Response {
  match state.proxy.dispatch(event).await {
    Ok(outcome) => outcome_response(outcome),
    Err(e) => error_response(e),
  }
}

fn outcome_response(outcome: EventOutcome) -> Response {
  match outcome {
    EventOutcome::Fetched(outcome) => into_http(outcome.into_response()),
    EventOutcome::Synced(report) => Json(report).into_response(),
    EventOutcome::Pending(records) => Json(records).into_response(),
    EventOutcome::Activated { purged } => Json(json!({ "purged": purged })).into_response(),
    EventOutcome::Installed => StatusCode::NO_CONTENT.into_response(),
    EventOutcome::Ignored { tag } => {
      (StatusCode::ACCEPTED, Json(json!({ "ignored": tag }))).into_response()
    }
  }
}

fn into_http(mut response: ProxyResponse) -> Response {
  let body = response.body.take().unwrap_or_default();
  let mut out = Response::new(AxumBody::from(body));
  *out.status_mut() = response.status;
  *out.headers_mut() = response.headers;
  out
}

fn error_response(err: ProxyError) -> Response {
  let status = match &err {
    ProxyError::Network(e) if e.is_delivery_failure() => StatusCode::BAD_GATEWAY,
    ProxyError::Network(_) | ProxyError::Body(_) => StatusCode::BAD_REQUEST,
    ProxyError::Storage(StorageError::Encoding(_)) => StatusCode::BAD_REQUEST,
    ProxyError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    ProxyError::Install(_) => StatusCode::INTERNAL_SERVER_ERROR,
  };
  warn!(status = %status, error = %err, "request failed");
  error_body(status, &err.to_string())
}

fn error_body(status: StatusCode, message: &str) -> Response {
  (status, Json(json!({ "error": message }))).into_response()
}

//! Test doubles shared by unit tests.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::error::TransportError;
use crate::http::{Body, ProxyRequest, ProxyResponse};
use crate::transport::Transport;

pub fn origin() -> Url {
  Url::parse("http://origin.test/").unwrap()
}

/// A request the fake transport received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub method: Method,
  pub url: String,
  pub body: Vec<u8>,
}

/// In-memory origin. Unknown routes answer 404; when offline every request
/// fails as if the server were unreachable.
pub struct FakeTransport {
  online: AtomicBool,
  routes: Mutex<HashMap<(Method, String), (StatusCode, Vec<u8>)>>,
  unreachable: Mutex<Vec<String>>,
  calls: Mutex<Vec<RecordedCall>>,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      unreachable: Mutex::new(Vec::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn route(&self, method: Method, url: &str, status: StatusCode, body: impl Into<Vec<u8>>) {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url.to_string()), (status, body.into()));
  }

  /// Make a single URL fail delivery while everything else works.
  pub fn fail_url(&self, url: &str) {
    self.unreachable.lock().unwrap().push(url.to_string());
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, mut request: ProxyRequest) -> Result<ProxyResponse, TransportError> {
    let body = request.body.take()?;
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(RecordedCall {
      method: request.method.clone(),
      url: url.clone(),
      body,
    });

    if !self.online.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&url) {
      return Err(TransportError::Unreachable(format!("{} unreachable", url)));
    }

    let routes = self.routes.lock().unwrap();
    let (status, body) = routes
      .get(&(request.method, url))
      .cloned()
      .unwrap_or((StatusCode::NOT_FOUND, Vec::new()));

    Ok(ProxyResponse::new(status, HeaderMap::new(), Body::new(body)))
  }
}

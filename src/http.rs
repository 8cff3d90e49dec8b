//! Request and response types that flow through the proxy.
//!
//! Bodies are single-consume: once [`Body::take`] has been called the bytes
//! are gone, and any later read fails with [`BodyError::AlreadyConsumed`].
//! Code that needs the payload twice must call `duplicate()` first.

use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::error::BodyError;

/// A payload that can be read exactly once.
#[derive(Debug, Default)]
pub struct Body {
  bytes: Option<Vec<u8>>,
}

impl Body {
  pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
    Self {
      bytes: Some(bytes.into()),
    }
  }

  pub fn empty() -> Self {
    Self::new(Vec::new())
  }

  pub fn is_consumed(&self) -> bool {
    self.bytes.is_none()
  }

  /// Read the body, leaving it consumed.
  pub fn take(&mut self) -> Result<Vec<u8>, BodyError> {
    self.bytes.take().ok_or(BodyError::AlreadyConsumed)
  }

  /// Copy an unread body. Fails if the body was already consumed.
  fn duplicate(&self) -> Result<Self, BodyError> {
    match &self.bytes {
      Some(bytes) => Ok(Self::new(bytes.clone())),
      None => Err(BodyError::AlreadyConsumed),
    }
  }
}

/// An intercepted request.
#[derive(Debug)]
pub struct ProxyRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Body,
}

impl ProxyRequest {
  pub fn new(method: Method, url: Url, headers: HeaderMap, body: Body) -> Self {
    Self {
      method,
      url,
      headers,
      body,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url, HeaderMap::new(), Body::empty())
  }

  /// Build a POST request with a JSON body.
  pub fn post_json<T: Serialize>(url: Url, payload: &T) -> Result<Self, BodyError> {
    let body = serde_json::to_vec(payload)?;
    let mut headers = HeaderMap::new();
    headers.insert(
      header::CONTENT_TYPE,
      HeaderValue::from_static("application/json"),
    );
    Ok(Self::new(Method::POST, url, headers, Body::new(body)))
  }

  pub fn with_accept(mut self, accept: &'static str) -> Self {
    self
      .headers
      .insert(header::ACCEPT, HeaderValue::from_static(accept));
    self
  }

  /// Copy the request, including its unread body.
  pub fn duplicate(&self) -> Result<Self, BodyError> {
    Ok(Self {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.duplicate()?,
    })
  }

  /// Lookup key used by the cache tiers.
  pub fn cache_key(&self) -> String {
    self.url.to_string()
  }

  /// Whether the Accept header mentions `needle`.
  pub fn accepts(&self, needle: &str) -> bool {
    self
      .headers
      .get(header::ACCEPT)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|accept| accept.contains(needle))
  }

  /// Consume the body and parse it as JSON.
  pub fn take_json<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
    let bytes = self.body.take()?;
    Ok(serde_json::from_slice(&bytes)?)
  }
}

/// A response produced by the origin, the cache, or the proxy itself.
#[derive(Debug)]
pub struct ProxyResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Body,
}

impl ProxyResponse {
  pub fn new(status: StatusCode, headers: HeaderMap, body: Body) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  /// A response with a JSON body.
  pub fn json<T: Serialize>(status: StatusCode, payload: &T) -> Result<Self, BodyError> {
    let body = serde_json::to_vec(payload)?;
    let mut headers = HeaderMap::new();
    headers.insert(
      header::CONTENT_TYPE,
      HeaderValue::from_static("application/json"),
    );
    Ok(Self::new(status, headers, Body::new(body)))
  }

  /// OK-class status (2xx).
  pub fn is_ok(&self) -> bool {
    self.status.is_success()
  }

  pub fn duplicate(&self) -> Result<Self, BodyError> {
    Ok(Self {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.duplicate()?,
    })
  }

  pub fn take_json<T: DeserializeOwned>(&mut self) -> Result<T, BodyError> {
    let bytes = self.body.take()?;
    Ok(serde_json::from_slice(&bytes)?)
  }
}

/// Remove headers that describe a single hop and must not be forwarded.
///
/// `content-encoding` and `content-length` go too: the transport decompresses
/// bodies, so upstream values no longer match the bytes we hold.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  for name in [
    header::CONNECTION,
    header::HOST,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::CONTENT_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHORIZATION,
  ] {
    headers.remove(name);
  }
  headers.remove("keep-alive");
}

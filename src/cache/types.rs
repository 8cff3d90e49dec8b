//! Core types for the cache tiers.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;

use crate::error::BodyError;
use crate::http::{Body, ProxyResponse};

/// One of the three named cache generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
  /// App shell, installed once
  Static,
  /// Populated lazily from live traffic
  Dynamic,
  /// Third-party assets, installed once and long-lived
  Immutable,
}

impl Tier {
  pub const ALL: [Tier; 3] = [Tier::Static, Tier::Dynamic, Tier::Immutable];

  pub fn as_str(&self) -> &'static str {
    match self {
      Tier::Static => "static",
      Tier::Dynamic => "dynamic",
      Tier::Immutable => "immutable",
    }
  }
}

impl std::fmt::Display for Tier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Named assets served when both cache and network miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
  OfflinePage,
  ErrorImage,
}

/// A response as held in a cache generation.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// When the entry was written (set by storage)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
  /// Capture a response for storage. Consumes the response body, so callers
  /// pass a duplicate when the original still has to be returned.
  pub fn capture(mut response: ProxyResponse) -> Result<Self, BodyError> {
    let body = response.body.take()?;
    let headers = response
      .headers
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    Ok(Self {
      status: response.status.as_u16(),
      headers,
      body,
      cached_at: None,
    })
  }

  /// Rebuild a fresh, unread response from the cached entry.
  pub fn to_response(&self) -> ProxyResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in &self.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        headers.append(name, value);
      }
    }
    let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

    ProxyResponse::new(status, headers, Body::new(self.body.clone()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_capture_keeps_status_headers_and_body() {
    let response = ProxyResponse::json(StatusCode::OK, &json!([{"name": "X"}])).unwrap();
    let cached = CachedResponse::capture(response).unwrap();

    assert_eq!(cached.status, 200);
    assert!(cached
      .headers
      .iter()
      .any(|(n, v)| n == "content-type" && v == "application/json"));

    let mut rebuilt = cached.to_response();
    let body: serde_json::Value = rebuilt.take_json().unwrap();
    assert_eq!(body, json!([{"name": "X"}]));
  }

  #[test]
  fn test_capture_of_consumed_body_fails() {
    let mut response = ProxyResponse::json(StatusCode::OK, &json!({})).unwrap();
    response.body.take().unwrap();
    assert!(CachedResponse::capture(response).is_err());
  }
}

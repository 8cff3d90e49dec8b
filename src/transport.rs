use async_trait::async_trait;
use std::time::Duration;

use crate::error::TransportError;
use crate::http::{strip_hop_by_hop, Body, ProxyRequest, ProxyResponse};

/// The network seam between the proxy and the origin server.
///
/// An HTTP error status is a successful delivery and comes back as `Ok`.
/// Only requests that never reached the server produce an error.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: ProxyRequest) -> Result<ProxyResponse, TransportError>;
}

/// Transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new(timeout: Duration) -> Result<Self, TransportError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, mut request: ProxyRequest) -> Result<ProxyResponse, TransportError> {
    let body = request.body.take()?;
    let mut headers = request.headers;
    strip_hop_by_hop(&mut headers);
    // The client decodes only what it negotiates itself.
    headers.remove(reqwest::header::ACCEPT_ENCODING);

    let response = self
      .client
      .request(request.method, request.url)
      .headers(headers)
      .body(body)
      .send()
      .await
      .map_err(map_reqwest_error)?;

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);

    let bytes = response.bytes().await.map_err(map_reqwest_error)?;

    Ok(ProxyResponse::new(status, headers, Body::new(bytes.to_vec())))
  }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::TimedOut
  } else {
    TransportError::Unreachable(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::StatusCode;
  use serde_json::{json, Value};
  use url::Url;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(5)).unwrap()
  }

  #[tokio::test]
  async fn test_post_reaches_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/items"))
      .and(body_json(json!({"name": "X"})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/items", server.uri())).unwrap();
    let request = ProxyRequest::post_json(url, &json!({"name": "X"})).unwrap();
    let mut response = transport().send(request).await.unwrap();

    assert_eq!(response.status, StatusCode::CREATED);
    let body: Value = response.take_json().unwrap();
    assert_eq!(body, json!({"ok": true}));
  }

  #[tokio::test]
  async fn test_error_status_is_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/items"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/items", server.uri())).unwrap();
    let response = transport().send(ProxyRequest::get(url)).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.is_ok());
  }

  #[tokio::test]
  async fn test_client_accept_encoding_is_not_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/items"))
      .and(|req: &wiremock::Request| {
        req
          .headers
          .get("accept-encoding")
          .and_then(|v| v.to_str().ok())
          .map_or(true, |v| !v.contains("br"))
      })
      .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
      .expect(1)
      .mount(&server)
      .await;

    let url = Url::parse(&format!("{}/items", server.uri())).unwrap();
    let mut request = ProxyRequest::get(url);
    request.headers.insert(
      reqwest::header::ACCEPT_ENCODING,
      reqwest::header::HeaderValue::from_static("gzip, deflate, br"),
    );
    let mut response = transport().send(request).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert!(response
      .headers
      .get(reqwest::header::CONTENT_ENCODING)
      .is_none());
    assert_eq!(response.body.take().unwrap(), b"[]");
  }

  #[tokio::test]
  async fn test_unreachable_server() {
    // Bind and release a port so nothing is listening on it.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap()
      .port();
    let url = Url::parse(&format!("http://127.0.0.1:{}/items", port)).unwrap();

    let err = transport().send(ProxyRequest::get(url)).await.unwrap_err();
    assert!(err.is_delivery_failure(), "unexpected error: {err:?}");
  }
}

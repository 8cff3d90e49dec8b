use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::queue::PendingWriteRecord;
use crate::recorder::QUEUED_ID_HEADER;
use crate::sync::SyncReport;

/// One entry of the catalog collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
  pub name: String,
  pub director: String,
  pub rating: String,
}

/// How the proxy answered a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
  /// The origin accepted the item
  Delivered,
  /// The origin was unreachable; the item waits in the queue under `id`
  QueuedLocally { id: i64 },
}

/// Talks to the catalog through a running proxy.
#[derive(Clone)]
pub struct CatalogClient {
  http: reqwest::Client,
  base: Url,
  collection_path: String,
}

impl CatalogClient {
  pub fn new(base: Url, collection_path: &str) -> Self {
    Self {
      http: reqwest::Client::new(),
      base,
      collection_path: collection_path.to_string(),
    }
  }

  fn url(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid proxy path '{}': {}", path, e))
  }

  /// Get the catalog, from the origin or from the proxy's caches
  pub async fn list(&self) -> Result<Vec<CatalogItem>> {
    let response = self
      .http
      .get(self.url(&self.collection_path)?)
      .header(reqwest::header::ACCEPT, "application/json")
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach proxy: {}", e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Failed to list items: proxy answered {}", status));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse item list: {}", e))
  }

  /// Add an item; a write the proxy could not deliver comes back queued
  pub async fn add(&self, item: &CatalogItem) -> Result<AddOutcome> {
    let response = self
      .http
      .post(self.url(&self.collection_path)?)
      .json(item)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach proxy: {}", e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("Failed to add '{}': proxy answered {}", item.name, status));
    }

    match response.headers().get(QUEUED_ID_HEADER) {
      Some(value) => {
        let id = value
          .to_str()
          .ok()
          .and_then(|v| v.parse().ok())
          .ok_or_else(|| eyre!("Malformed {} header: {:?}", QUEUED_ID_HEADER, value))?;
        Ok(AddOutcome::QueuedLocally { id })
      }
      None => Ok(AddOutcome::Delivered),
    }
  }

  /// Writes still waiting for replay
  pub async fn pending(&self) -> Result<Vec<PendingWriteRecord>> {
    let response = self
      .http
      .get(self.url("/__proxy/pending")?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach proxy: {}", e))?;

    response
      .error_for_status()
      .map_err(|e| eyre!("Failed to list pending writes: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse pending writes: {}", e))
  }

  /// Ask the proxy to replay its queue now
  pub async fn sync(&self) -> Result<SyncReport> {
    let response = self
      .http
      .post(self.url("/__proxy/sync")?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach proxy: {}", e))?;

    response
      .error_for_status()
      .map_err(|e| eyre!("Sync failed: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse sync report: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{body_json, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn item() -> CatalogItem {
    CatalogItem {
      name: "Metropolis".to_string(),
      director: "Fritz Lang".to_string(),
      rating: "PG".to_string(),
    }
  }

  fn client(server: &MockServer) -> CatalogClient {
    CatalogClient::new(Url::parse(&server.uri()).unwrap(), "/items")
  }

  #[tokio::test]
  async fn test_list_items() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/items"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([
        {"name": "Metropolis", "director": "Fritz Lang", "rating": "PG"}
      ])))
      .mount(&server)
      .await;

    let items = client(&server).list().await.unwrap();
    assert_eq!(items, vec![item()]);
  }

  #[tokio::test]
  async fn test_list_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/items"))
      .respond_with(ResponseTemplate::new(502))
      .mount(&server)
      .await;

    assert!(client(&server).list().await.is_err());
  }

  #[tokio::test]
  async fn test_add_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/items"))
      .and(body_json(json!({"name": "Metropolis", "director": "Fritz Lang", "rating": "PG"})))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
      .expect(1)
      .mount(&server)
      .await;

    let outcome = client(&server).add(&item()).await.unwrap();
    assert_eq!(outcome, AddOutcome::Delivered);
  }

  #[tokio::test]
  async fn test_add_queued_locally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/items"))
      .respond_with(
        ResponseTemplate::new(200)
          .insert_header(QUEUED_ID_HEADER, "12")
          .set_body_json(json!({"message": "Saved locally. Synchronization pending."})),
      )
      .mount(&server)
      .await;

    let outcome = client(&server).add(&item()).await.unwrap();
    assert_eq!(outcome, AddOutcome::QueuedLocally { id: 12 });
  }

  #[tokio::test]
  async fn test_sync_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/__proxy/sync"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({"replayed": [1, 2], "failed": [], "deferred": [3]})),
      )
      .mount(&server)
      .await;

    let report = client(&server).sync().await.unwrap();
    assert_eq!(report.replayed, vec![1, 2]);
    assert_eq!(report.deferred, vec![3]);
  }
}

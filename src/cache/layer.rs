//! Cache tier manager: install, activate, lookup and store.

use futures::future::join_all;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::types::{CachedResponse, Fallback, Tier};
use crate::config::CacheConfig;
use crate::error::{InstallError, StorageError};
use crate::http::ProxyRequest;
use crate::transport::Transport;

/// Manages the static, dynamic and immutable cache generations.
///
/// Generation names come from the [`CacheConfig`] given at construction.
pub struct CacheTierManager<S: CacheStorage> {
  storage: Arc<S>,
  config: CacheConfig,
  /// Base for resolving same-origin manifest paths
  origin: Url,
}

impl<S: CacheStorage> CacheTierManager<S> {
  pub fn new(storage: S, config: CacheConfig, origin: Url) -> Self {
    Self {
      storage: Arc::new(storage),
      config,
      origin,
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.config
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Populate the static and immutable tiers from their manifests.
  ///
  /// Each tier is written atomically: if any listed asset cannot be fetched
  /// with an OK status, nothing is stored for that tier and the install
  /// fails. Retrying is left to the caller.
  pub async fn install(&self, transport: &dyn Transport) -> Result<(), InstallError> {
    let (static_result, immutable_result) = tokio::join!(
      self.install_tier(Tier::Static, transport),
      self.install_tier(Tier::Immutable, transport),
    );
    static_result?;
    immutable_result?;
    Ok(())
  }

  async fn install_tier(&self, tier: Tier, transport: &dyn Transport) -> Result<(), InstallError> {
    let name = self.config.generation_name(tier);
    let manifest = self.config.manifest(tier);

    let fetches = manifest.iter().map(|asset| async move {
      let url = self
        .resolve(asset)
        .map_err(|e| format!("{} ({})", asset, e))?;
      let response = transport
        .send(ProxyRequest::get(url.clone()))
        .await
        .map_err(|e| format!("{} ({})", url, e))?;
      if !response.is_ok() {
        return Err(format!("{} (status {})", url, response.status));
      }
      let cached = CachedResponse::capture(response).map_err(|e| format!("{} ({})", url, e))?;
      Ok((url.to_string(), cached))
    });

    let mut entries = Vec::with_capacity(manifest.len());
    let mut failed = Vec::new();
    for result in join_all(fetches).await {
      match result {
        Ok(entry) => entries.push(entry),
        Err(reason) => failed.push(reason),
      }
    }

    if !failed.is_empty() {
      warn!(cache = %name, failed = failed.len(), "cache install incomplete, nothing stored");
      return Err(InstallError::PartialInstall {
        tier: tier.to_string(),
        failed,
      });
    }

    self.storage.put_all(&name, &entries)?;
    info!(cache = %name, assets = entries.len(), "installed cache");
    Ok(())
  }

  /// Delete every generation that is not one of the current three.
  /// Returns the names that were removed.
  pub fn activate(&self) -> Result<Vec<String>, StorageError> {
    let current = self.config.current_generations();
    let mut purged = Vec::new();

    for name in self.storage.cache_names()? {
      if current.contains(&name) {
        continue;
      }
      if self.storage.delete_cache(&name)? {
        info!(cache = %name, "purged stale cache generation");
        purged.push(name);
      }
    }

    Ok(purged)
  }

  /// Look up a cached response for the request in any generation.
  /// Only GET requests are ever answered from cache.
  pub fn lookup(&self, request: &ProxyRequest) -> Result<Option<CachedResponse>, StorageError> {
    if request.method != Method::GET {
      return Ok(None);
    }
    self.storage.match_any(&request.cache_key())
  }

  /// Store a response in one tier under `request_key`.
  pub fn store(
    &self,
    tier: Tier,
    request_key: &str,
    response: &CachedResponse,
  ) -> Result<(), StorageError> {
    let name = self.config.generation_name(tier);
    self.storage.put(&name, request_key, response)?;
    debug!(cache = %name, key = request_key, "stored response");
    Ok(())
  }

  /// The named fallback asset, if it was installed.
  pub fn fallback(&self, kind: Fallback) -> Result<Option<CachedResponse>, StorageError> {
    let path = match kind {
      Fallback::OfflinePage => &self.config.offline_page,
      Fallback::ErrorImage => &self.config.error_image,
    };
    match self.resolve(path) {
      Ok(url) => self.storage.match_any(url.as_str()),
      Err(e) => {
        warn!(path = %path, error = %e, "invalid fallback asset path");
        Ok(None)
      }
    }
  }

  /// Existing generation names, current or stale.
  pub fn generations(&self) -> Result<Vec<String>, StorageError> {
    self.storage.cache_names()
  }

  fn resolve(&self, asset: &str) -> Result<Url, url::ParseError> {
    self.origin.join(asset)
  }
}

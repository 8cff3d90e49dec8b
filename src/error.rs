//! Error taxonomy for the proxy core.
//!
//! Library code returns these typed errors; the binary wraps them with
//! `color_eyre` at the edge.

use thiserror::Error;

/// A request or response body was misused.
#[derive(Debug, Error)]
pub enum BodyError {
  /// The body stream was already read once.
  #[error("body already consumed")]
  AlreadyConsumed,

  #[error("body is not valid JSON: {0}")]
  InvalidJson(#[from] serde_json::Error),
}

/// Failure to deliver a request to the origin.
#[derive(Debug, Error)]
pub enum TransportError {
  /// The request never reached the server.
  #[error("network failure: {0}")]
  Unreachable(String),

  #[error("request timed out")]
  TimedOut,

  #[error(transparent)]
  Body(#[from] BodyError),
}

impl TransportError {
  /// True when the server was never reached, as opposed to a local misuse.
  pub fn is_delivery_failure(&self) -> bool {
    matches!(self, Self::Unreachable(_) | Self::TimedOut)
  }
}

/// The local database could not be used.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage unavailable: {0}")]
  Unavailable(String),

  #[error("failed to encode record: {0}")]
  Encoding(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Unavailable(e.to_string())
  }
}

/// Cache installation failed.
#[derive(Debug, Error)]
pub enum InstallError {
  /// One or more manifest assets could not be fetched; nothing was stored
  /// for that tier.
  #[error("failed to install {tier} cache, {} asset(s) unavailable: {}", failed.len(), failed.join(", "))]
  PartialInstall { tier: String, failed: Vec<String> },

  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Top-level error for handling a proxy event.
#[derive(Debug, Error)]
pub enum ProxyError {
  #[error(transparent)]
  Network(#[from] TransportError),

  #[error(transparent)]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Body(#[from] BodyError),

  #[error(transparent)]
  Install(#[from] InstallError),
}

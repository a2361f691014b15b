//! Error taxonomy shared by every cache component.

/// Errors produced by the caching layer.
///
/// Payloads are plain strings so the error can be cloned and handed to every
/// caller that shares a single in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
  /// Nothing is cached under the requested identity or key
  #[error("Not found: {0}")]
  NotFound(String),
  /// The semaphore was torn down while this caller was queued
  #[error("Semaphore purged while waiting for a permit")]
  Purged,
  /// The underlying fetch or decrypt failed
  #[error("Fetch failed: {0}")]
  FetchFailed(String),
  /// Bootstrap failed; the application cannot start
  #[error("Setup failed: {0}")]
  SetupFailed(String),
  /// Every observer went away before the fetch finished
  #[error("Fetch cancelled")]
  Cancelled,
  /// The key-value store rejected an operation
  #[error("Storage error: {0}")]
  Storage(String),
  #[error("Serialization error: {0}")]
  Serialization(String),
  /// A scoped operation panicked
  #[error("Operation panicked: {0}")]
  Panicked(String),
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    CacheError::Storage(e.to_string())
  }
}

impl From<serde_json::Error> for CacheError {
  fn from(e: serde_json::Error) -> Self {
    CacheError::Serialization(e.to_string())
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

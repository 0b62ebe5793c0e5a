//! Error taxonomy for the local data layer.

use std::time::Duration;

use crate::store::{Index, Partition};

/// Errors surfaced by the cache, ledger, history and outbox.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The durable store cannot be opened or used.
  #[error("local storage unavailable: {0}")]
  StorageUnavailable(String),

  /// The durable store rejected a write for lack of space.
  #[error("storage quota exceeded: {0}")]
  QuotaExceeded(String),

  /// The remote service could not be reached (includes timeouts).
  #[error("network unreachable: {0}")]
  NetworkUnreachable(String),

  /// The remote service answered with a non-success status.
  #[error("remote returned HTTP {status}: {message}")]
  Remote { status: u16, message: String },

  /// A queued operation was rejected by the remote for a non-connectivity reason.
  #[error("outbox operation {operation_id} rejected on replay: {reason}")]
  ConflictOnReplay {
    operation_id: String,
    reason: String,
  },

  #[error("not found: {0}")]
  NotFound(String),

  /// Snapshots are append-only.
  #[error("version {0} already exists")]
  VersionExists(String),

  #[error("index {index:?} does not belong to partition {partition:?}")]
  InvalidIndex { index: Index, partition: Partition },

  #[error("configuration error: {0}")]
  Config(String),

  /// The document host refused the insertion.
  #[error("document host error: {0}")]
  Document(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
  pub fn timeout(after: Duration) -> Self {
    Self::NetworkUnreachable(format!("request timed out after {}ms", after.as_millis()))
  }

  /// Whether retrying later may succeed without anything else changing.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::NetworkUnreachable(_) => true,
      Self::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
      _ => false,
    }
  }

  /// Whether the failure means the remote is unreachable altogether.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::NetworkUnreachable(_))
  }
}

impl From<rusqlite::Error> for CacheError {
  fn from(e: rusqlite::Error) -> Self {
    match &e {
      rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::DiskFull => {
        Self::QuotaExceeded(e.to_string())
      }
      _ => Self::StorageUnavailable(e.to_string()),
    }
  }
}

impl From<reqwest::Error> for CacheError {
  fn from(e: reqwest::Error) -> Self {
    match e.status() {
      Some(status) => Self::Remote {
        status: status.as_u16(),
        message: e.to_string(),
      },
      None => Self::NetworkUnreachable(e.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classification() {
    assert!(CacheError::NetworkUnreachable("down".into()).is_transient());
    assert!(CacheError::Remote {
      status: 503,
      message: String::new()
    }
    .is_transient());
    assert!(CacheError::Remote {
      status: 429,
      message: String::new()
    }
    .is_transient());
    assert!(!CacheError::Remote {
      status: 404,
      message: String::new()
    }
    .is_transient());
    assert!(!CacheError::QuotaExceeded("full".into()).is_transient());
  }

  #[test]
  fn test_timeout_is_connectivity() {
    let err = CacheError::timeout(Duration::from_secs(10));
    assert!(err.is_connectivity());
    assert!(err.to_string().contains("10000ms"));
  }

  #[test]
  fn test_disk_full_maps_to_quota() {
    let err = rusqlite::Error::SqliteFailure(
      rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
      Some("database or disk is full".to_string()),
    );
    assert!(matches!(CacheError::from(err), CacheError::QuotaExceeded(_)));
  }
}

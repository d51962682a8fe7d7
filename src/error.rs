//! Error taxonomy shared by the store, the action queue and the cache worker.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Failure of the local durable store.
#[derive(Debug, Error)]
pub enum StorageError {
  /// The database hit its size limit or the disk is full.
  #[error("local storage quota exceeded: {0}")]
  QuotaExceeded(String),
  /// The database could not be opened, read or written.
  #[error("local storage unavailable: {0}")]
  Unavailable(String),
  #[error("failed to (de)serialize record: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("invalid record: {0}")]
  InvalidRecord(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(err: rusqlite::Error) -> Self {
    match err.sqlite_error_code() {
      Some(ErrorCode::DiskFull) | Some(ErrorCode::TooBig) => Self::QuotaExceeded(err.to_string()),
      _ => Self::Unavailable(err.to_string()),
    }
  }
}

/// Failure to hand a queued action to the server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
  /// Connection refused, timeout or connectivity lost mid-send.
  #[error("could not reach server for {endpoint}: {message}")]
  Network { endpoint: String, message: String },
  /// The server answered with a non-success status.
  #[error("server rejected {endpoint} with status {status}")]
  Rejected { endpoint: String, status: u16 },
}

impl DeliveryError {
  /// Whether the failure came from the transport rather than the server.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network { .. })
  }
}

/// A network fetch issued by the cache worker failed before producing a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("network request for {url} failed: {message}")]
pub struct NetworkError {
  pub url: String,
  pub message: String,
}

/// Neither the network nor the cache could satisfy a request.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("no network and no cached response for {url}")]
  CacheMiss { url: String },
  /// Request went straight to the network (not cacheable, or no generation in control).
  #[error(transparent)]
  Network(#[from] NetworkError),
  #[error(transparent)]
  Storage(#[from] StorageError),
}

/// Lifecycle failures of a cache generation.
#[derive(Debug, Error)]
pub enum InstallError {
  #[error("failed to prime {generation}, unreachable manifest entries: {}", .failed.join(", "))]
  ManifestFetch {
    generation: String,
    failed: Vec<String>,
  },
  #[error("generation {0} is not installed")]
  NotInstalled(String),
  #[error(transparent)]
  Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_disk_full_maps_to_quota() {
    let err = rusqlite::Error::SqliteFailure(
      rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
      None,
    );
    assert!(matches!(StorageError::from(err), StorageError::QuotaExceeded(_)));
  }

  #[test]
  fn test_other_sqlite_errors_are_unavailable() {
    let err = rusqlite::Error::SqliteFailure(
      rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_READONLY),
      None,
    );
    assert!(matches!(StorageError::from(err), StorageError::Unavailable(_)));
  }

  #[test]
  fn test_install_error_lists_failed_entries() {
    let err = InstallError::ManifestFetch {
      generation: "gym-manager-v2".to_string(),
      failed: vec!["/dashboard".to_string(), "/static/js/main.js".to_string()],
    };
    assert_eq!(
      err.to_string(),
      "failed to prime gym-manager-v2, unreachable manifest entries: /dashboard, /static/js/main.js"
    );
  }
}

//! Error taxonomy for the sync engine.
//!
//! Network and storage failures are classified here so the retry policy and the
//! offline queue can decide between retrying, queueing, and surfacing.

use std::time::Duration;

use uuid::Uuid;

/// Failure to get any response from the remote API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
  /// Connection refused, DNS failure, reset, etc.
  #[error("connectivity lost: {0}")]
  Connectivity(String),

  /// The per-call timeout elapsed before a response arrived.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
}

/// Persistent storage failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
  /// The backend refused the write because it is out of space.
  #[error("storage is full")]
  Full,

  #[error("storage unavailable: {0}")]
  Unavailable(String),

  /// A stored record could not be decoded.
  #[error("corrupt record: {0}")]
  Corrupt(String),
}

/// Errors surfaced by the cache/queue/sync layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
  /// No response received.
  #[error("connectivity error: {0}")]
  Connectivity(#[from] TransportError),

  /// 5xx-class response.
  #[error("server error: HTTP {status}")]
  Server { status: u16 },

  /// 4xx-class response.
  #[error("client error: HTTP {status}: {body}")]
  Client { status: u16, body: String },

  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  /// A queued mutation ran out of replay attempts.
  #[error("queued operation {id} failed permanently after {attempts} attempts")]
  PermanentQueueFailure { id: Uuid, attempts: u32 },

  #[error("serialization error: {0}")]
  Serialization(String),
}

impl SyncError {
  /// Classify an HTTP status. Returns `None` for non-error statuses.
  pub fn from_status(status: u16, body: &[u8]) -> Option<Self> {
    match status {
      500..=599 => Some(Self::Server { status }),
      400..=499 => Some(Self::Client {
        status,
        body: String::from_utf8_lossy(body).into_owned(),
      }),
      _ => None,
    }
  }

  /// HTTP status carried by this error, if any.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Server { status } | Self::Client { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// True when no response was received at all.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Connectivity(_))
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_status_classifies_ranges() {
    assert!(matches!(
      SyncError::from_status(503, b""),
      Some(SyncError::Server { status: 503 })
    ));
    assert!(matches!(
      SyncError::from_status(404, b"not found"),
      Some(SyncError::Client { status: 404, .. })
    ));
    assert!(SyncError::from_status(200, b"").is_none());
    assert!(SyncError::from_status(204, b"").is_none());
  }

  #[test]
  fn test_client_error_keeps_body() {
    let err = SyncError::from_status(422, b"title is required").unwrap();
    assert_eq!(err.to_string(), "client error: HTTP 422: title is required");
    assert_eq!(err.status(), Some(422));
  }
}

//! Queue item, input and notification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::cache::{CacheEntry, CachedValue};
use crate::invalidation::Operation;
use crate::network::HttpRequest;

/// Replay state of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
  /// Never attempted
  Pending,
  /// A replay is in progress
  InFlight,
  /// Failed at least once, waiting for a later drain
  Retrying,
}

/// Prior cache state for an optimistically updated key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
  pub key: String,
  /// Entry before the optimistic write, `None` if the key was absent
  pub previous: Option<CacheEntry>,
}

/// A write operation waiting for the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: Uuid,
  pub operation_type: Operation,
  pub resource_type: String,
  #[serde(default)]
  pub resource_id: Option<String>,
  #[serde(with = "crate::cache::hex_bytes")]
  pub payload: Vec<u8>,
  pub target_url: String,
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  pub enqueued_at: DateTime<Utc>,
  pub attempt_count: u32,
  pub max_attempts: u32,
  pub state: ItemState,
  /// Earliest time the next replay may run
  #[serde(default)]
  pub next_attempt_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub last_error: Option<String>,
  #[serde(default)]
  pub snapshot: Option<CacheSnapshot>,
}

impl QueueItem {
  /// Rebuild the network request for a replay.
  pub fn request(&self) -> HttpRequest {
    HttpRequest {
      method: self.method.clone(),
      url: self.target_url.clone(),
      headers: self.headers.clone(),
      body: if self.payload.is_empty() {
        None
      } else {
        Some(self.payload.clone())
      },
    }
  }

  /// Whether the backoff delay has elapsed.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// Value written to the cache before the mutation reaches the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticWrite {
  pub key: String,
  pub value: CachedValue,
  pub ttl: std::time::Duration,
}

/// A mutation to queue.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub operation: Operation,
  pub resource_type: String,
  pub resource_id: Option<String>,
  pub request: HttpRequest,
  /// Overrides the policy's mutation attempt budget
  pub max_attempts: Option<u32>,
  pub optimistic: Option<OptimisticWrite>,
}

impl NewMutation {
  pub fn new(
    operation: Operation,
    resource_type: impl Into<String>,
    resource_id: Option<String>,
    request: HttpRequest,
  ) -> Self {
    Self {
      operation,
      resource_type: resource_type.into(),
      resource_id,
      request,
      max_attempts: None,
      optimistic: None,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }

  pub fn with_optimistic(mut self, write: OptimisticWrite) -> Self {
    self.optimistic = Some(write);
    self
  }
}

/// A permanently failed mutation awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
  pub id: Uuid,
  pub operation_type: Operation,
  pub resource_type: String,
  pub resource_id: Option<String>,
  pub target_url: String,
  pub attempts: u32,
  pub error: String,
  pub failed_at: DateTime<Utc>,
}

/// Queue change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Enqueued { id: Uuid, depth: usize },
  Succeeded { id: Uuid, depth: usize },
  Retrying {
    id: Uuid,
    attempt: u32,
    next_attempt_at: DateTime<Utc>,
  },
  PermanentlyFailed(FailureNotice),
  Purged { count: usize },
}

//! Retry eligibility and exponential backoff with jitter.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

use crate::error::SyncError;

/// Request timeout status; retryable despite being 4xx.
const REQUEST_TIMEOUT: u16 = 408;
/// Rate limited status; retryable despite being 4xx.
const TOO_MANY_REQUESTS: u16 = 429;

/// Whether an error class may ever succeed on a later attempt.
pub fn is_retryable(error: &SyncError) -> bool {
  match error {
    SyncError::Connectivity(_) | SyncError::Server { .. } => true,
    SyncError::Client { status, .. } => matches!(*status, REQUEST_TIMEOUT | TOO_MANY_REQUESTS),
    SyncError::Storage(_)
    | SyncError::PermanentQueueFailure { .. }
    | SyncError::Serialization(_) => false,
  }
}

/// Retry after `attempt` failed attempts out of `max_attempts`?
pub fn should_retry(error: &SyncError, attempt: u32, max_attempts: u32) -> bool {
  attempt < max_attempts && is_retryable(error)
}

/// Deterministic part of the delay: `min(base * factor^(attempt-1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, factor: f64) -> Duration {
  let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
  let scaled = base.as_secs_f64() * factor.max(1.0).powi(exponent);
  if !scaled.is_finite() || scaled >= max.as_secs_f64() {
    max
  } else {
    Duration::from_secs_f64(scaled)
  }
}

/// Backoff plus uniform random jitter in `[0, max_jitter]`.
pub fn next_delay(
  attempt: u32,
  base: Duration,
  max: Duration,
  factor: f64,
  max_jitter: Duration,
) -> Duration {
  let jitter_ms = max_jitter.as_millis().min(u64::MAX as u128) as u64;
  let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
  backoff_delay(attempt, base, max, factor) + jitter
}

/// Kind of operation, which decides the attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
  /// Idempotent reads
  Read,
  /// Create/update/delete; replays risk duplication, so fewer attempts
  Mutation,
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub backoff_factor: f64,
  pub max_jitter_ms: u64,
  pub read_max_attempts: u32,
  pub mutation_max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay_ms: 1000,
      max_delay_ms: 30_000,
      backoff_factor: 2.0,
      max_jitter_ms: 1000,
      read_max_attempts: 3,
      mutation_max_attempts: 2,
    }
  }
}

impl RetryPolicy {
  pub fn max_attempts(&self, kind: OperationKind) -> u32 {
    match kind {
      OperationKind::Read => self.read_max_attempts,
      OperationKind::Mutation => self.mutation_max_attempts,
    }
  }

  pub fn should_retry(&self, error: &SyncError, attempt: u32, max_attempts: u32) -> bool {
    should_retry(error, attempt, max_attempts)
  }

  pub fn next_delay(&self, attempt: u32) -> Duration {
    next_delay(
      attempt,
      Duration::from_millis(self.base_delay_ms),
      Duration::from_millis(self.max_delay_ms),
      self.backoff_factor,
      Duration::from_millis(self.max_jitter_ms),
    )
  }
}

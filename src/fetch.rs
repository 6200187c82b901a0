//! Read-through fetching: cache first, network on a miss.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::{CacheStore, CachedValue};
use crate::error::{SyncError, TransportError};
use crate::metrics::{LatencyCategory, MetricsCollector};
use crate::network::{call_checked, Connectivity, HttpRequest, HttpResponse, Transport};
use crate::resources::ResourceSpec;
use crate::retry::{OperationKind, RetryPolicy};

/// Where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
  /// Fresh data from network
  Network,
  /// Unexpired cache entry
  Cache,
}

/// Result of a fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub value: CachedValue,
  pub source: FetchSource,
}

/// Sits between callers and the transport, providing transparent caching of reads.
#[derive(Clone)]
pub struct Fetcher {
  cache: Arc<CacheStore>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  metrics: Arc<MetricsCollector>,
  retry: RetryPolicy,
}

impl Fetcher {
  pub fn new(
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    metrics: Arc<MetricsCollector>,
    retry: RetryPolicy,
  ) -> Self {
    Self {
      cache,
      transport,
      connectivity,
      metrics,
      retry,
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. On a miss, fetch from network with the read retry budget
  /// 3. Store the response body under the resource TTL
  pub async fn fetch(&self, resource: &ResourceSpec) -> Result<FetchResult, SyncError> {
    if let Some(value) = self.cache.load(&resource.key) {
      return Ok(FetchResult {
        value,
        source: FetchSource::Cache,
      });
    }
    self.refresh(resource).await
  }

  /// Fetch from the network regardless of the cache, then store.
  pub async fn refresh(&self, resource: &ResourceSpec) -> Result<FetchResult, SyncError> {
    let response = self.read(&HttpRequest::get(resource.path.clone())).await?;
    let value = CachedValue::new(resource.type_tag.clone(), response.body);
    self.cache.save(&resource.key, value.clone(), resource.ttl());
    debug!(key = %resource.key, "Cached fresh response");

    Ok(FetchResult {
      value,
      source: FetchSource::Network,
    })
  }

  /// Issue a single network call, recording latency and outcome.
  ///
  /// A connection failure marks the network offline.
  pub async fn call_once(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
    let started = Instant::now();
    let result = call_checked(self.transport.as_ref(), request).await;
    self
      .metrics
      .record_operation(LatencyCategory::Network, started.elapsed(), result.is_err());
    if let Err(SyncError::Connectivity(TransportError::Connectivity(msg))) = &result {
      warn!(url = %request.url, error = %msg, "Connection failed, going offline");
      self.connectivity.set_online(false);
    }
    result
  }

  /// Idempotent read with retries and backoff.
  pub async fn read(&self, request: &HttpRequest) -> Result<HttpResponse, SyncError> {
    if !self.connectivity.is_online() {
      return Err(TransportError::Connectivity("offline".to_string()).into());
    }

    let max_attempts = self.retry.max_attempts(OperationKind::Read).max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self.call_once(request).await {
        Ok(response) => return Ok(response),
        // Offline now; the health check brings it back.
        Err(err @ SyncError::Connectivity(TransportError::Connectivity(_))) => return Err(err),
        Err(err) if self.retry.should_retry(&err, attempt, max_attempts) => {
          let delay = self.retry.next_delay(attempt);
          warn!(url = %request.url, attempt, ?delay, error = %err, "Read failed, retrying");
          tokio::time::sleep(delay).await;
        }
        Err(err) => return Err(err),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{quick_retry, Stack};

  fn fetcher(stack: &Stack) -> Fetcher {
    Fetcher::new(
      stack.cache.clone(),
      stack.transport.clone(),
      stack.connectivity.clone(),
      stack.metrics.clone(),
      quick_retry(),
    )
  }

  fn dashboard() -> ResourceSpec {
    ResourceSpec {
      key: "statistics:dashboard".into(),
      path: "/api/v1/statistics/dashboard".into(),
      ttl_secs: 60,
      type_tag: "statistics".into(),
    }
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    stack.transport.push_response(200, br#"{"total":4}"#);

    let first = fetcher.fetch(&dashboard()).await.unwrap();
    assert_eq!(first.source, FetchSource::Network);
    assert_eq!(first.value.bytes, br#"{"total":4}"#);

    let second = fetcher.fetch(&dashboard()).await.unwrap();
    assert_eq!(second.source, FetchSource::Cache);
    assert_eq!(stack.transport.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_expired_entry_refetches() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);

    fetcher.fetch(&dashboard()).await.unwrap();
    stack.clock.advance(chrono::Duration::seconds(61));
    let again = fetcher.fetch(&dashboard()).await.unwrap();

    assert_eq!(again.source, FetchSource::Network);
    assert_eq!(stack.transport.calls().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_read_retries_server_errors() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    stack.transport.push_status(503);
    stack.transport.push_status(500);
    stack.transport.push_response(200, b"[]");

    let result = fetcher.fetch(&dashboard()).await.unwrap();
    assert_eq!(result.value.bytes, b"[]");
    assert_eq!(stack.transport.calls().len(), 3);

    let snapshot = stack.metrics.snapshot(0);
    assert!((snapshot.error_rate - 2.0 / 3.0).abs() < 1e-9);
  }

  #[tokio::test(start_paused = true)]
  async fn test_read_gives_up_after_budget() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    for _ in 0..3 {
      stack.transport.push_status(503);
    }

    let err = fetcher.fetch(&dashboard()).await.unwrap_err();
    assert!(matches!(err, SyncError::Server { status: 503 }));
    assert_eq!(stack.transport.calls().len(), 3);
    assert!(stack.cache.load("statistics:dashboard").is_none());
  }

  #[tokio::test]
  async fn test_client_error_is_not_retried() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    stack.transport.push_status(401);

    let err = fetcher.fetch(&dashboard()).await.unwrap_err();
    assert_eq!(err.status(), Some(401));
    assert_eq!(stack.transport.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_connection_failure_marks_offline() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    stack
      .transport
      .push_error(TransportError::Connectivity("connection refused".into()));

    let err = fetcher.fetch(&dashboard()).await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!stack.connectivity.is_online());
    assert_eq!(stack.transport.calls().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_retried_and_stays_online() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    stack
      .transport
      .push_error(TransportError::Timeout(std::time::Duration::from_secs(10)));

    let result = fetcher.fetch(&dashboard()).await.unwrap();
    assert_eq!(result.source, FetchSource::Network);
    assert!(stack.connectivity.is_online());
    assert_eq!(stack.transport.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_offline_read_fails_fast() {
    let stack = Stack::new();
    let fetcher = fetcher(&stack);
    stack.connectivity.set_online(false);

    let err = fetcher.fetch(&dashboard()).await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(stack.transport.calls().is_empty());
  }
}

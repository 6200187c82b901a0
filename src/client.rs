//! UI-facing facade over the cache, queue and metrics.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{CacheStore, CachedValue};
use crate::error::SyncError;
use crate::fetch::{FetchResult, Fetcher};
use crate::invalidation::{InvalidationGraph, Operation};
use crate::metrics::{MetricsCollector, MetricsExport, MetricsSnapshot};
use crate::network::{Connectivity, HttpResponse};
use crate::queue::{FailureNotice, NewMutation, OfflineQueue, QueueEvent};
use crate::resources::ResourceSpec;
use crate::retry::is_retryable;

/// How a mutation was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The server accepted it; affected cache keys are already invalidated
  Applied(HttpResponse),
  /// Queued for replay once the network allows
  Queued(Uuid),
}

/// Cache-aware client for the UI layer.
///
/// Reads go through the cache, writes either reach the server or land in the
/// offline queue. Only client errors surface to the caller.
#[derive(Clone)]
pub struct SyncClient {
  cache: Arc<CacheStore>,
  fetcher: Fetcher,
  queue: Arc<OfflineQueue>,
  invalidation: Arc<InvalidationGraph>,
  metrics: Arc<MetricsCollector>,
  connectivity: Connectivity,
  default_ttl: Duration,
}

const DEFAULT_TTL: Duration = Duration::from_secs(300);

impl SyncClient {
  pub fn new(
    cache: Arc<CacheStore>,
    fetcher: Fetcher,
    queue: Arc<OfflineQueue>,
    invalidation: Arc<InvalidationGraph>,
    metrics: Arc<MetricsCollector>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      cache,
      fetcher,
      queue,
      invalidation,
      metrics,
      connectivity,
      default_ttl: DEFAULT_TTL,
    }
  }

  /// TTL used by [`SyncClient::cache_write_default`].
  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }

  pub fn cache_read(&self, key: &str) -> Option<CachedValue> {
    self.cache.load(key)
  }

  pub fn cache_write(&self, key: &str, value: CachedValue, ttl: Duration) {
    self.cache.save(key, value, ttl)
  }

  pub fn cache_write_default(&self, key: &str, value: CachedValue) {
    self.cache.save(key, value, self.default_ttl)
  }

  /// Cache-first read of a resource.
  pub async fn fetch(&self, resource: &ResourceSpec) -> Result<FetchResult, SyncError> {
    self.fetcher.fetch(resource).await
  }

  /// Send a mutation, queueing it when the network or server is unavailable.
  ///
  /// On success the invalidation rules run before this returns, so a cache
  /// read right after never sees data the write made stale.
  pub async fn mutate(&self, mutation: NewMutation) -> Result<MutationOutcome, SyncError> {
    if !self.connectivity.is_online() {
      debug!(resource_type = %mutation.resource_type, "Offline, queueing mutation");
      return Ok(MutationOutcome::Queued(self.queue.enqueue(mutation)));
    }
    // Keep FIFO order behind writes that are already waiting.
    if self.queue.depth() > 0 {
      return Ok(MutationOutcome::Queued(self.queue.enqueue(mutation)));
    }

    match self.fetcher.call_once(&mutation.request).await {
      Ok(response) => {
        self.invalidate(
          &mutation.resource_type,
          mutation.operation,
          mutation.resource_id.as_deref(),
        );
        Ok(MutationOutcome::Applied(response))
      }
      Err(err) if is_retryable(&err) => {
        info!(
          resource_type = %mutation.resource_type,
          error = %err,
          "Mutation failed, queueing for replay"
        );
        Ok(MutationOutcome::Queued(self.queue.enqueue(mutation)))
      }
      Err(err) => Err(err),
    }
  }

  /// Queue a mutation without trying the network first.
  pub fn enqueue_mutation(&self, mutation: NewMutation) -> Uuid {
    self.queue.enqueue(mutation)
  }

  pub fn queue_depth(&self) -> usize {
    self.queue.depth()
  }

  /// Subscribe to queue changes.
  pub fn on_queue_change(&self) -> broadcast::Receiver<QueueEvent> {
    self.queue.subscribe()
  }

  /// Drop every cache key made stale by this change.
  pub fn invalidate(
    &self,
    resource_type: &str,
    operation: Operation,
    resource_id: Option<&str>,
  ) -> Vec<String> {
    self
      .invalidation
      .invalidate(resource_type, operation, resource_id)
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot(self.queue.depth())
  }

  pub fn export_metrics(&self) -> MetricsExport {
    self.metrics.export(self.queue.depth(), self.cache.size())
  }

  pub fn reset_metrics(&self) {
    self.metrics.reset()
  }

  /// Permanent failures the UI has not acknowledged yet.
  pub fn pending_failures(&self) -> Vec<FailureNotice> {
    self.queue.pending_failures()
  }

  pub fn acknowledge_failure(&self, id: Uuid) -> bool {
    self.queue.acknowledge(id)
  }

  /// Discard all queued mutations, rolling back their optimistic writes.
  pub fn purge_queue(&self) -> usize {
    self.queue.purge()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TransportError;
  use crate::network::HttpRequest;
  use crate::queue::OptimisticWrite;
  use crate::resources::{TrackerKey, INTERVIEW, POSITION};
  use crate::testing::{quick_retry, Stack};

  fn client(stack: &Stack) -> SyncClient {
    let fetcher = Fetcher::new(
      stack.cache.clone(),
      stack.transport.clone(),
      stack.connectivity.clone(),
      stack.metrics.clone(),
      quick_retry(),
    );
    SyncClient::new(
      stack.cache.clone(),
      fetcher,
      stack.queue.clone(),
      stack.invalidation.clone(),
      stack.metrics.clone(),
      stack.connectivity.clone(),
    )
  }

  fn update_interview(id: &str) -> NewMutation {
    let key = TrackerKey::Interview { id: id.to_string() };
    NewMutation::new(
      Operation::Update,
      INTERVIEW,
      Some(id.to_string()),
      HttpRequest::new("PUT", key.path()).with_json_body(br#"{"status":"done"}"#.to_vec()),
    )
  }

  fn json(body: &str) -> CachedValue {
    CachedValue::new("json", body.as_bytes().to_vec())
  }

  #[tokio::test]
  async fn test_successful_write_invalidates_before_returning() {
    let stack = Stack::new();
    let client = client(&stack);
    let ttl = Duration::from_secs(300);
    client.cache_write("interviews:42", json(r#"{"status":"scheduled"}"#), ttl);
    client.cache_write("interviews:list:all", json("[]"), ttl);
    client.cache_write("positions:list:all", json("[]"), ttl);

    let outcome = client.mutate(update_interview("42")).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Applied(_)));

    assert!(client.cache_read("interviews:42").is_none());
    assert!(client.cache_read("interviews:list:all").is_none());
    assert!(client.cache_read("positions:list:all").is_some());
    assert_eq!(client.queue_depth(), 0);
  }

  #[tokio::test]
  async fn test_default_ttl_applies_to_plain_writes() {
    let stack = Stack::new();
    let client = client(&stack).with_default_ttl(Duration::from_secs(60));
    client.cache_write_default("statistics:dashboard", json("{}"));

    stack.clock.advance(chrono::Duration::seconds(59));
    assert!(client.cache_read("statistics:dashboard").is_some());
    stack.clock.advance(chrono::Duration::seconds(2));
    assert!(client.cache_read("statistics:dashboard").is_none());
  }

  #[tokio::test]
  async fn test_not_found_is_returned_and_never_queued() {
    let stack = Stack::new();
    let client = client(&stack);
    let mut events = client.on_queue_change();
    stack.transport.push_status(404);

    let err = client.mutate(update_interview("42")).await.unwrap_err();
    assert!(matches!(err, SyncError::Client { status: 404, .. }));
    assert_eq!(client.queue_depth(), 0);
    assert!(events.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_server_error_queues() {
    let stack = Stack::new();
    let client = client(&stack);
    stack.transport.push_status(502);

    let outcome = client.mutate(update_interview("42")).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert_eq!(client.queue_depth(), 1);
    assert!(stack.connectivity.is_online());
  }

  #[tokio::test]
  async fn test_connection_failure_queues_and_goes_offline() {
    let stack = Stack::new();
    let client = client(&stack);
    stack
      .transport
      .push_error(TransportError::Connectivity("connection refused".into()));

    let outcome = client.mutate(update_interview("42")).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert!(!stack.connectivity.is_online());

    // Further writes skip the network entirely.
    client.mutate(update_interview("43")).await.unwrap();
    assert_eq!(stack.transport.calls().len(), 1);
    assert_eq!(client.queue_depth(), 2);
  }

  #[tokio::test]
  async fn test_writes_queue_behind_pending_items() {
    let stack = Stack::new();
    let client = client(&stack);
    client.enqueue_mutation(update_interview("1"));

    let outcome = client.mutate(update_interview("2")).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(_)));
    assert!(stack.transport.calls().is_empty());
    assert_eq!(client.queue_depth(), 2);
  }

  #[tokio::test]
  async fn test_optimistic_write_is_visible_while_queued() {
    let stack = Stack::new();
    let client = client(&stack);
    stack.connectivity.set_online(false);
    let key = TrackerKey::Position { id: "7".into() };

    let mutation = NewMutation::new(
      Operation::Update,
      POSITION,
      Some("7".into()),
      HttpRequest::new("PUT", key.path()),
    )
    .with_optimistic(OptimisticWrite {
      key: key.cache_key(),
      value: json(r#"{"status":"offer"}"#),
      ttl: Duration::from_secs(60),
    });
    client.mutate(mutation).await.unwrap();

    let cached = client.cache_read("positions:7").unwrap();
    assert_eq!(cached.bytes, br#"{"status":"offer"}"#);

    assert_eq!(client.purge_queue(), 1);
    assert!(client.cache_read("positions:7").is_none());
  }

  #[tokio::test]
  async fn test_metrics_through_facade() {
    let stack = Stack::new();
    let client = client(&stack);
    client.cache_write("statistics:dashboard", json("{}"), Duration::from_secs(60));
    client.cache_read("statistics:dashboard");
    client.cache_read("statistics:timeline");
    stack.connectivity.set_online(false);
    client.enqueue_mutation(update_interview("1"));

    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.misses, 1);
    assert_eq!(snapshot.queue_depth, 1);
    assert_eq!(snapshot.health_score, 85);

    let export = client.export_metrics();
    assert_eq!(export.cache_size.item_count, 1);

    client.reset_metrics();
    assert_eq!(client.metrics_snapshot().hits, 0);
  }
}

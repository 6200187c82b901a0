//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::cache::CacheStore;
use crate::clock::ManualClock;
use crate::error::TransportError;
use crate::invalidation::{default_rules, InvalidationGraph};
use crate::metrics::MetricsCollector;
use crate::network::{Connectivity, HttpRequest, HttpResponse, Transport};
use crate::queue::{OfflineQueue, QueueDeps};
use crate::retry::RetryPolicy;
use crate::storage::MemoryStorage;

/// Transport that replays scripted outcomes and records every request.
///
/// When the script runs out it answers `200 {}`.
#[derive(Default)]
pub struct ScriptedTransport {
  script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
  calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push_status(&self, status: u16) {
    self.push_response(status, b"{}");
  }

  pub fn push_response(&self, status: u16, body: &[u8]) {
    self.script.lock().unwrap().push_back(Ok(HttpResponse {
      status,
      body: body.to_vec(),
    }));
  }

  pub fn push_error(&self, error: TransportError) {
    self.script.lock().unwrap().push_back(Err(error));
  }

  pub fn calls(&self) -> Vec<HttpRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_urls(&self) -> Vec<String> {
    self.calls().into_iter().map(|r| r.url).collect()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn call(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
    self.calls.lock().unwrap().push(request.clone());
    self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| {
        Ok(HttpResponse {
          status: 200,
          body: b"{}".to_vec(),
        })
      })
  }
}

/// Retry policy without jitter or delays, for deterministic tests.
pub fn quick_retry() -> RetryPolicy {
  RetryPolicy {
    base_delay_ms: 1000,
    max_delay_ms: 8000,
    backoff_factor: 2.0,
    max_jitter_ms: 0,
    read_max_attempts: 3,
    mutation_max_attempts: 2,
  }
}

/// A fully wired engine over in-memory storage and a manual clock.
pub struct Stack {
  pub clock: Arc<ManualClock>,
  pub storage: Arc<MemoryStorage>,
  pub metrics: Arc<MetricsCollector>,
  pub cache: Arc<CacheStore>,
  pub invalidation: Arc<InvalidationGraph>,
  pub transport: Arc<ScriptedTransport>,
  pub connectivity: Connectivity,
  pub queue: Arc<OfflineQueue>,
}

impl Stack {
  pub fn new() -> Self {
    Self::with_storage(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::default()))
  }

  pub fn with_storage(storage: Arc<MemoryStorage>, clock: Arc<ManualClock>) -> Self {
    let metrics = Arc::new(MetricsCollector::default());
    let cache = Arc::new(CacheStore::new(
      storage.clone(),
      clock.clone(),
      "test",
      metrics.clone(),
    ));
    let invalidation = Arc::new(InvalidationGraph::new(default_rules(), cache.clone()));
    let transport = Arc::new(ScriptedTransport::new());
    let connectivity = Connectivity::new(true);
    let queue = Arc::new(OfflineQueue::open(QueueDeps {
      storage: storage.clone(),
      cache: cache.clone(),
      invalidation: invalidation.clone(),
      transport: transport.clone(),
      connectivity: connectivity.clone(),
      clock: clock.clone(),
      metrics: metrics.clone(),
      retry: quick_retry(),
    }));

    Self {
      clock,
      storage,
      metrics,
      cache,
      invalidation,
      transport,
      connectivity,
      queue,
    }
  }

  /// Reopen the queue over the same storage, as after a restart.
  pub fn restart(&self) -> Self {
    Self::with_storage(self.storage.clone(), self.clock.clone())
  }
}

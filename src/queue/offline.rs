//! Durable FIFO queue of mutations waiting for the network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::item::{CacheSnapshot, FailureNotice, ItemState, NewMutation, QueueEvent, QueueItem};
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::error::{SyncError, TransportError};
use crate::invalidation::InvalidationGraph;
use crate::metrics::{LatencyCategory, MetricsCollector};
use crate::network::{call_checked, Connectivity, Transport};
use crate::retry::{OperationKind, RetryPolicy};
use crate::storage::KeyValueStorage;

/// Storage key of the serialized item list.
pub const QUEUE_KEY: &str = "queue";
/// Storage key of unacknowledged permanent failures.
pub const FAILURES_KEY: &str = "queue:failures";

const EVENT_CAPACITY: usize = 64;

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSkip {
  Offline,
  AlreadyDraining,
}

/// Outcome of one `drain` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
  pub skipped: Option<DrainSkip>,
  pub succeeded: Vec<Uuid>,
  pub failed: Vec<Uuid>,
  /// Head item left in place for a later drain
  pub blocked_on: Option<Uuid>,
  /// Drain stopped because the network went away mid-drain
  pub lost_connectivity: bool,
}

impl DrainReport {
  fn skipped(reason: DrainSkip) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }
}

/// Clears the draining flag however the drain exits.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

/// Collaborators the queue needs for replay.
pub struct QueueDeps {
  pub storage: Arc<dyn KeyValueStorage>,
  pub cache: Arc<CacheStore>,
  pub invalidation: Arc<InvalidationGraph>,
  pub transport: Arc<dyn Transport>,
  pub connectivity: Connectivity,
  pub clock: Arc<dyn Clock>,
  pub metrics: Arc<MetricsCollector>,
  pub retry: RetryPolicy,
}

/// Ordered list of pending writes, persisted after every change.
///
/// Items replay strictly in enqueue order. A retrying item stays at the head
/// and blocks everything behind it until it succeeds or fails permanently.
pub struct OfflineQueue {
  deps: QueueDeps,
  items: Mutex<Vec<QueueItem>>,
  failures: Mutex<Vec<FailureNotice>>,
  depth: AtomicUsize,
  draining: AtomicBool,
  events: broadcast::Sender<QueueEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn load_json<T>(storage: &dyn KeyValueStorage, key: &str) -> T
where
  T: serde::de::DeserializeOwned + Default,
{
  match storage.get(key) {
    Ok(Some(data)) => serde_json::from_slice(&data).unwrap_or_else(|e| {
      error!(key, error = %e, "Discarding undecodable queue state");
      T::default()
    }),
    Ok(None) => T::default(),
    Err(e) => {
      warn!(key, error = %e, "Queue storage unavailable, starting empty");
      T::default()
    }
  }
}

impl OfflineQueue {
  /// Restore the queue from storage.
  pub fn open(deps: QueueDeps) -> Self {
    let mut items: Vec<QueueItem> = load_json(deps.storage.as_ref(), QUEUE_KEY);
    // A replay interrupted by shutdown already counted its attempt.
    for item in items.iter_mut().filter(|i| i.state == ItemState::InFlight) {
      item.state = ItemState::Retrying;
    }
    let failures: Vec<FailureNotice> = load_json(deps.storage.as_ref(), FAILURES_KEY);
    if !items.is_empty() {
      info!(depth = items.len(), "Restored offline queue");
    }

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      depth: AtomicUsize::new(items.len()),
      items: Mutex::new(items),
      failures: Mutex::new(failures),
      draining: AtomicBool::new(false),
      events,
      deps,
    }
  }

  fn persist(&self, items: &[QueueItem]) {
    self.depth.store(items.len(), Ordering::Release);
    match serde_json::to_vec(items) {
      Ok(data) => {
        if let Err(e) = self.deps.storage.set(QUEUE_KEY, &data) {
          // The in-memory list stays authoritative for this process.
          error!(error = %e, depth = items.len(), "Failed to persist offline queue");
        }
      }
      Err(e) => error!(error = %e, "Failed to serialize offline queue"),
    }
  }

  fn persist_failures(&self, failures: &[FailureNotice]) {
    let result = serde_json::to_vec(failures)
      .map_err(SyncError::from)
      .and_then(|data| Ok(self.deps.storage.set(FAILURES_KEY, &data)?));
    if let Err(e) = result {
      error!(error = %e, "Failed to persist queue failures");
    }
  }

  fn notify(&self, event: QueueEvent) {
    // No receivers is fine.
    let _ = self.events.send(event);
  }

  /// Subscribe to queue changes.
  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.events.subscribe()
  }

  /// Number of queued items. Lock-free.
  pub fn depth(&self) -> usize {
    self.depth.load(Ordering::Acquire)
  }

  /// Copy of the queued items in replay order.
  pub fn items(&self) -> Vec<QueueItem> {
    lock(&self.items).clone()
  }

  /// Append a mutation. Applies its optimistic cache write, if any.
  pub fn enqueue(&self, mutation: NewMutation) -> Uuid {
    let id = Uuid::new_v4();

    let snapshot = mutation.optimistic.as_ref().map(|write| {
      let previous = self.deps.cache.entry(&write.key);
      self
        .deps
        .cache
        .save(&write.key, write.value.clone(), write.ttl);
      CacheSnapshot {
        key: write.key.clone(),
        previous,
      }
    });

    let request = mutation.request;
    let item = QueueItem {
      id,
      operation_type: mutation.operation,
      resource_type: mutation.resource_type,
      resource_id: mutation.resource_id,
      payload: request.body.unwrap_or_default(),
      target_url: request.url,
      method: request.method,
      headers: request.headers,
      enqueued_at: self.deps.clock.now(),
      attempt_count: 0,
      max_attempts: mutation
        .max_attempts
        .unwrap_or_else(|| self.deps.retry.max_attempts(OperationKind::Mutation))
        .max(1),
      state: ItemState::Pending,
      next_attempt_at: None,
      last_error: None,
      snapshot,
    };

    let depth = {
      let mut items = lock(&self.items);
      info!(
        id = %item.id,
        resource_type = %item.resource_type,
        operation = ?item.operation_type,
        "Queued mutation for replay"
      );
      items.push(item);
      self.persist(&items);
      items.len()
    };

    self.notify(QueueEvent::Enqueued { id, depth });
    id
  }

  fn rollback(&self, snapshot: &CacheSnapshot) {
    match &snapshot.previous {
      Some(entry) => self.deps.cache.restore(entry),
      None => {
        self.deps.cache.remove(&snapshot.key);
      }
    }
    debug!(key = %snapshot.key, "Rolled back optimistic cache write");
  }

  /// Undo a failed item's optimistic write. A later queued write to the same
  /// key inherits the prior entry instead, so the cache keeps showing the
  /// still-pending value and never falls back to a rejected one.
  fn release_snapshot(&self, snapshot: &CacheSnapshot) {
    {
      let mut items = lock(&self.items);
      let later = items
        .iter_mut()
        .filter_map(|i| i.snapshot.as_mut())
        .find(|s| s.key == snapshot.key);
      if let Some(later) = later {
        later.previous = snapshot.previous.clone();
        self.persist(&items);
        debug!(key = %snapshot.key, "Handed rollback to later queued write");
        return;
      }
    }
    self.rollback(snapshot);
  }

  /// Remove the item with `id` and return it with the new depth.
  fn take(&self, id: Uuid) -> Option<(QueueItem, usize)> {
    let mut items = lock(&self.items);
    let pos = items.iter().position(|i| i.id == id)?;
    let item = items.remove(pos);
    self.persist(&items);
    Some((item, items.len()))
  }

  /// Apply `f` to the item with `id` and persist.
  fn update(&self, id: Uuid, f: impl FnOnce(&mut QueueItem)) -> Option<QueueItem> {
    let mut items = lock(&self.items);
    let item = items.iter_mut().find(|i| i.id == id)?;
    f(item);
    let updated = item.clone();
    self.persist(&items);
    Some(updated)
  }

  /// Next item to replay, if it is due. `Err` carries a head that is still backing off.
  fn head(&self) -> Option<Result<QueueItem, Uuid>> {
    let items = lock(&self.items);
    let head = items.first()?;
    if head.is_due(self.deps.clock.now()) {
      Some(Ok(head.clone()))
    } else {
      Some(Err(head.id))
    }
  }

  fn fail_permanently(&self, id: Uuid, err: &SyncError) -> Option<FailureNotice> {
    let (item, depth) = self.take(id)?;
    if let Some(snapshot) = &item.snapshot {
      self.release_snapshot(snapshot);
    }

    let notice = FailureNotice {
      id: item.id,
      operation_type: item.operation_type,
      resource_type: item.resource_type.clone(),
      resource_id: item.resource_id.clone(),
      target_url: item.target_url.clone(),
      attempts: item.attempt_count,
      error: err.to_string(),
      failed_at: self.deps.clock.now(),
    };
    {
      let mut failures = lock(&self.failures);
      failures.push(notice.clone());
      self.persist_failures(&failures);
    }

    error!(
      id = %item.id,
      resource_type = %item.resource_type,
      attempts = item.attempt_count,
      depth,
      error = %err,
      "Queued mutation failed permanently"
    );
    self.notify(QueueEvent::PermanentlyFailed(notice.clone()));
    Some(notice)
  }

  /// Replay queued items in FIFO order.
  ///
  /// No-op while offline or while another drain runs. Stops at the first item
  /// that must wait for a retry.
  pub async fn drain(&self) -> DrainReport {
    if !self.deps.connectivity.is_online() {
      return DrainReport::skipped(DrainSkip::Offline);
    }
    if self.draining.swap(true, Ordering::AcqRel) {
      return DrainReport::skipped(DrainSkip::AlreadyDraining);
    }
    let _guard = DrainGuard(&self.draining);

    let mut report = DrainReport::default();
    while let Some(head) = self.head() {
      let item = match head {
        Ok(item) => item,
        Err(id) => {
          report.blocked_on = Some(id);
          break;
        }
      };

      // Budget already spent, e.g. a replay interrupted by a restart.
      if item.attempt_count >= item.max_attempts {
        let err = SyncError::PermanentQueueFailure {
          id: item.id,
          attempts: item.attempt_count,
        };
        if self.fail_permanently(item.id, &err).is_some() {
          report.failed.push(item.id);
        }
        continue;
      }

      let Some(item) = self.update(item.id, |i| {
        i.attempt_count += 1;
        i.state = ItemState::InFlight;
      }) else {
        // Purged while we were looking at it.
        continue;
      };

      let started = Instant::now();
      let result = call_checked(self.deps.transport.as_ref(), &item.request()).await;
      self
        .deps
        .metrics
        .record_operation(LatencyCategory::Replay, started.elapsed(), result.is_err());

      match result {
        Ok(_) => {
          let Some((done, depth)) = self.take(item.id) else {
            continue;
          };
          self.deps.invalidation.invalidate(
            &done.resource_type,
            done.operation_type,
            done.resource_id.as_deref(),
          );
          debug!(id = %done.id, depth, "Replayed queued mutation");
          report.succeeded.push(done.id);
          self.notify(QueueEvent::Succeeded { id: done.id, depth });
        }
        Err(SyncError::Connectivity(TransportError::Connectivity(msg))) => {
          // The request never left; it does not consume an attempt.
          self.update(item.id, |i| {
            i.attempt_count -= 1;
            i.state = ItemState::Retrying;
            i.last_error = Some(msg.clone());
          });
          warn!(id = %item.id, error = %msg, "Lost connectivity during replay");
          self.deps.connectivity.set_online(false);
          report.lost_connectivity = true;
          report.blocked_on = Some(item.id);
          break;
        }
        Err(err) if self.deps.retry.should_retry(&err, item.attempt_count, item.max_attempts) => {
          let delay = chrono::Duration::from_std(self.deps.retry.next_delay(item.attempt_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
          let next_attempt_at = self.deps.clock.now() + delay;
          self.update(item.id, |i| {
            i.state = ItemState::Retrying;
            i.next_attempt_at = Some(next_attempt_at);
            i.last_error = Some(err.to_string());
          });
          warn!(
            id = %item.id,
            attempt = item.attempt_count,
            max_attempts = item.max_attempts,
            error = %err,
            "Replay failed, will retry"
          );
          self.notify(QueueEvent::Retrying {
            id: item.id,
            attempt: item.attempt_count,
            next_attempt_at,
          });
          report.blocked_on = Some(item.id);
          break;
        }
        Err(err) => {
          if self.fail_permanently(item.id, &err).is_some() {
            report.failed.push(item.id);
          }
        }
      }
    }

    report
  }

  /// Drop every queued item, rolling back optimistic writes. Returns the count.
  pub fn purge(&self) -> usize {
    let removed: Vec<QueueItem> = {
      let mut items = lock(&self.items);
      let removed = std::mem::take(&mut *items);
      self.persist(&items);
      removed
    };
    for snapshot in removed.iter().rev().filter_map(|i| i.snapshot.as_ref()) {
      self.rollback(snapshot);
    }
    let count = removed.len();
    if count > 0 {
      info!(count, "Purged offline queue");
    }
    self.notify(QueueEvent::Purged { count });
    count
  }

  /// Permanent failures not yet acknowledged by the UI.
  pub fn pending_failures(&self) -> Vec<FailureNotice> {
    lock(&self.failures).clone()
  }

  /// Mark a failure as seen. Returns whether it was pending.
  pub fn acknowledge(&self, id: Uuid) -> bool {
    let mut failures = lock(&self.failures);
    let before = failures.len();
    failures.retain(|f| f.id != id);
    let found = failures.len() != before;
    if found {
      self.persist_failures(&failures);
    }
    found
  }
}

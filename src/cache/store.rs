//! Versioned, TTL-bounded cache over persistent storage.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheSize, CachedValue};
use crate::clock::Clock;
use crate::error::StorageError;
use crate::metrics::MetricsCollector;
use crate::storage::KeyValueStorage;

/// Storage namespace for cache records.
pub const CACHE_PREFIX: &str = "cache:";

fn storage_key(key: &str) -> String {
  format!("{}{}", CACHE_PREFIX, key)
}

/// Outcome of reading a raw record.
enum Lookup {
  Fresh(CacheEntry),
  /// Present but expired, from another schema version, or undecodable
  Stale,
  Missing,
}

/// Key/value cache with time-based expiry.
///
/// An entry is served only while `now < expires_at` and its schema version
/// matches the running build. Anything else counts as a miss and is purged on
/// the spot. There is no capacity-based eviction.
pub struct CacheStore {
  storage: Arc<dyn KeyValueStorage>,
  clock: Arc<dyn Clock>,
  schema_version: String,
  metrics: Arc<MetricsCollector>,
}

impl CacheStore {
  pub fn new(
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    schema_version: impl Into<String>,
    metrics: Arc<MetricsCollector>,
  ) -> Self {
    Self {
      storage,
      clock,
      schema_version: schema_version.into(),
      metrics,
    }
  }

  pub fn schema_version(&self) -> &str {
    &self.schema_version
  }

  fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
      .ok()
      .and_then(|ttl| now.checked_add_signed(ttl))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  /// Store `value` under `key` for `ttl`.
  ///
  /// Best-effort: if storage is full, expired entries are swept and the write
  /// is retried once. Any remaining failure is logged and swallowed.
  pub fn save(&self, key: &str, value: CachedValue, ttl: Duration) {
    let now = self.clock.now();
    let entry = CacheEntry {
      key: key.to_string(),
      value,
      stored_at: now,
      expires_at: self.expiry(now, ttl),
      schema_version: self.schema_version.clone(),
    };
    self.write_entry(&entry);
  }

  /// Write a pre-built entry back, e.g. when rolling back an optimistic update.
  pub fn restore(&self, entry: &CacheEntry) {
    self.write_entry(entry);
  }

  fn write_entry(&self, entry: &CacheEntry) {
    let data = match serde_json::to_vec(entry) {
      Ok(data) => data,
      Err(e) => {
        warn!(key = %entry.key, error = %e, "Failed to serialize cache entry");
        return;
      }
    };
    let skey = storage_key(&entry.key);

    match self.storage.set(&skey, &data) {
      Ok(()) => {}
      Err(StorageError::Full) => {
        let swept = self.sweep_expired();
        debug!(key = %entry.key, swept, "Storage full, retrying cache write after sweep");
        if let Err(e) = self.storage.set(&skey, &data) {
          warn!(key = %entry.key, error = %e, "Dropping cache write");
        }
      }
      Err(e) => warn!(key = %entry.key, error = %e, "Dropping cache write"),
    }
  }

  fn lookup(&self, key: &str) -> Lookup {
    let skey = storage_key(key);
    let data = match self.storage.get(&skey) {
      Ok(Some(data)) => data,
      Ok(None) => return Lookup::Missing,
      Err(e) => {
        debug!(key, error = %e, "Cache read failed, treating as miss");
        return Lookup::Missing;
      }
    };

    match serde_json::from_slice::<CacheEntry>(&data) {
      Ok(entry) if entry.is_readable(self.clock.now(), &self.schema_version) => {
        Lookup::Fresh(entry)
      }
      Ok(_) => Lookup::Stale,
      Err(e) => {
        warn!(key, error = %e, "Corrupt cache record");
        Lookup::Stale
      }
    }
  }

  fn purge(&self, key: &str) {
    if let Err(e) = self.storage.remove(&storage_key(key)) {
      debug!(key, error = %e, "Failed to purge stale cache record");
    }
  }

  /// Read the value for `key`, or `None` when it is missing, expired, or from
  /// another schema version. Stale records are removed as a side effect.
  pub fn load(&self, key: &str) -> Option<CachedValue> {
    let started = Instant::now();
    let (value, stale) = match self.lookup(key) {
      Lookup::Fresh(entry) => (Some(entry.value), false),
      Lookup::Stale => {
        self.purge(key);
        debug!(key, "Purged stale cache entry");
        (None, true)
      }
      Lookup::Missing => (None, false),
    };
    self
      .metrics
      .record_cache_read(value.is_some(), stale, started.elapsed());
    value
  }

  /// Raw readable entry for `key`, without touching metrics.
  pub fn entry(&self, key: &str) -> Option<CacheEntry> {
    match self.lookup(key) {
      Lookup::Fresh(entry) => Some(entry),
      Lookup::Stale => {
        self.purge(key);
        None
      }
      Lookup::Missing => None,
    }
  }

  /// Delete `key`. Returns whether a record existed.
  pub fn remove(&self, key: &str) -> bool {
    match self.storage.remove(&storage_key(key)) {
      Ok(existed) => existed,
      Err(e) => {
        warn!(key, error = %e, "Failed to remove cache entry");
        false
      }
    }
  }

  /// Logical keys (without the storage namespace) starting with `prefix`.
  pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
    match self.storage.keys_with_prefix(&storage_key(prefix)) {
      Ok(keys) => keys
        .into_iter()
        .filter_map(|k| k.strip_prefix(CACHE_PREFIX).map(String::from))
        .collect(),
      Err(e) => {
        warn!(prefix, error = %e, "Failed to enumerate cache keys");
        Vec::new()
      }
    }
  }

  /// Remove every cache entry. Returns the number removed.
  pub fn clear_all(&self) -> usize {
    let keys = self.keys_with_prefix("");
    keys.iter().filter(|k| self.remove(k)).count()
  }

  /// Remove every expired or version-mismatched entry. Returns the number removed.
  pub fn sweep_expired(&self) -> usize {
    let keys = self.keys_with_prefix("");
    let removed = keys
      .iter()
      .filter(|k| matches!(self.lookup(k), Lookup::Stale))
      .filter(|k| self.remove(k))
      .count();
    if removed > 0 {
      debug!(removed, "Swept expired cache entries");
    }
    removed
  }

  /// Approximate footprint, summing serialized record sizes.
  pub fn size(&self) -> CacheSize {
    let keys = match self.storage.keys_with_prefix(CACHE_PREFIX) {
      Ok(keys) => keys,
      Err(_) => return CacheSize::default(),
    };

    keys
      .iter()
      .filter_map(|k| self.storage.get(k).ok().flatten().map(|v| k.len() + v.len()))
      .fold(CacheSize::default(), |acc, bytes| CacheSize {
        total_bytes: acc.total_bytes + bytes,
        item_count: acc.item_count + 1,
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::storage::MemoryStorage;

  struct Fixture {
    clock: Arc<ManualClock>,
    storage: Arc<MemoryStorage>,
    metrics: Arc<MetricsCollector>,
    cache: CacheStore,
  }

  fn fixture_with(storage: MemoryStorage) -> Fixture {
    let clock = Arc::new(ManualClock::default());
    let storage = Arc::new(storage);
    let metrics = Arc::new(MetricsCollector::default());
    let cache = CacheStore::new(storage.clone(), clock.clone(), "1.0.0", metrics.clone());
    Fixture {
      clock,
      storage,
      metrics,
      cache,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(MemoryStorage::new())
  }

  fn value(s: &str) -> CachedValue {
    CachedValue::new("text", s.as_bytes().to_vec())
  }

  #[test]
  fn test_save_then_load_round_trip() {
    let f = fixture();
    f.cache.save("positions:1", value("acme"), Duration::from_secs(60));

    assert_eq!(f.cache.load("positions:1"), Some(value("acme")));
    assert_eq!(f.metrics.snapshot(0).hits, 1);
  }

  #[test]
  fn test_expired_entry_is_absent_and_purged() {
    let f = fixture();
    f.cache.save("positions:1", value("acme"), Duration::from_secs(60));
    assert_eq!(f.cache.size().item_count, 1);

    f.clock.advance(chrono::Duration::seconds(60));
    assert_eq!(f.cache.load("positions:1"), None);
    assert_eq!(f.cache.size().item_count, 0);

    let snapshot = f.metrics.snapshot(0);
    assert_eq!(snapshot.misses, 1);
    assert!((snapshot.stale_ratio - 1.0).abs() < f64::EPSILON);
  }

  #[test]
  fn test_schema_mismatch_is_a_miss() {
    let f = fixture();
    f.cache.save("positions:1", value("acme"), Duration::from_secs(60));

    let newer = CacheStore::new(
      f.storage.clone(),
      f.clock.clone(),
      "2.0.0",
      f.metrics.clone(),
    );
    assert_eq!(newer.load("positions:1"), None);
    assert!(f.storage.get("cache:positions:1").unwrap().is_none());
  }

  #[test]
  fn test_sweep_removes_only_stale() {
    let f = fixture();
    f.cache.save("a", value("1"), Duration::from_secs(10));
    f.cache.save("b", value("2"), Duration::from_secs(100));
    f.storage.set("queue", b"[]").unwrap();

    f.clock.advance(chrono::Duration::seconds(30));
    assert_eq!(f.cache.sweep_expired(), 1);
    assert_eq!(f.cache.keys_with_prefix(""), vec!["b"]);
    assert!(f.storage.get("queue").unwrap().is_some());
  }

  #[test]
  fn test_storage_full_sweeps_and_retries() {
    let f = fixture_with(MemoryStorage::with_quota(400));
    f.cache.save("old", value("x".repeat(60).as_str()), Duration::from_secs(1));
    f.cache.save("older", value("y".repeat(60).as_str()), Duration::from_secs(1));
    f.clock.advance(chrono::Duration::seconds(5));

    f.cache.save("new", value("z".repeat(60).as_str()), Duration::from_secs(60));
    assert!(f.cache.load("new").is_some());
    assert_eq!(f.cache.size().item_count, 1);
  }

  #[test]
  fn test_storage_full_fails_silently() {
    let f = fixture_with(MemoryStorage::with_quota(32));
    f.cache.save("big", value("z".repeat(200).as_str()), Duration::from_secs(60));
    assert_eq!(f.cache.load("big"), None);
  }

  #[test]
  fn test_clear_all_leaves_other_namespaces() {
    let f = fixture();
    f.cache.save("a", value("1"), Duration::from_secs(10));
    f.cache.save("b", value("2"), Duration::from_secs(10));
    f.storage.set("queue", b"[]").unwrap();

    assert_eq!(f.cache.clear_all(), 2);
    assert_eq!(f.cache.size(), CacheSize::default());
    assert!(f.storage.get("queue").unwrap().is_some());
  }

  #[test]
  fn test_restore_writes_entry_back() {
    let f = fixture();
    f.cache.save("positions:1", value("before"), Duration::from_secs(60));
    let snapshot = f.cache.entry("positions:1").unwrap();

    f.cache.save("positions:1", value("after"), Duration::from_secs(60));
    f.cache.restore(&snapshot);
    assert_eq!(f.cache.load("positions:1"), Some(value("before")));
  }
}

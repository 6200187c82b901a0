//! Persistent key/value storage primitives.
//!
//! The cache and the offline queue both sit on a `KeyValueStorage`. Backends are
//! synchronous; failures are reported as `StorageError` and callers decide how to
//! degrade (the cache treats them as misses, the queue keeps its in-memory copy).

mod sqlite;

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::StorageError;

pub use sqlite::SqliteStorage;

/// Trait for storage backends.
pub trait KeyValueStorage: Send + Sync {
  /// Read a value.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// Insert or replace a value. The whole value is replaced atomically.
  fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

  /// Delete a value. Returns whether it existed.
  fn remove(&self, key: &str) -> Result<bool, StorageError>;

  /// All keys starting with `prefix`, in lexical order.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Storage implementation that doesn't store anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl KeyValueStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &[u8]) -> Result<(), StorageError> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &str) -> Result<bool, StorageError> {
    Ok(false)
  }

  fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
    Ok(Vec::new())
  }
}

/// In-memory storage, optionally bounded by a byte quota.
///
/// This is the fallback when the on-disk database cannot be opened, and the
/// backend used by tests. Writes that would push the total size (keys plus
/// values) past the quota fail with `StorageError::Full`.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
  quota_bytes: Option<usize>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a storage that refuses writes beyond `quota_bytes`.
  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota_bytes: Some(quota_bytes),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StorageError> {
    self
      .entries
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))
  }
}

impl KeyValueStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
    let mut entries = self.lock()?;

    if let Some(quota) = self.quota_bytes {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| k.len() + v.len())
        .sum();
      if used + key.len() + value.len() > quota {
        return Err(StorageError::Full);
      }
    }

    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool, StorageError> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    Ok(
      self
        .lock()?
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, _)| k.clone())
        .collect(),
    )
  }
}

//! SQLite-backed key/value storage.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::KeyValueStorage;
use crate::error::StorageError;

/// SQLite-based storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the storage at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open storage database at {}: {}", path.display(), e))?;

    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tracker-sync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORAGE_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("Lock poisoned: {}", e)))
  }
}

const STORAGE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

fn map_sqlite_error(e: rusqlite::Error) -> StorageError {
  match e.sqlite_error_code() {
    Some(ErrorCode::DiskFull) => StorageError::Full,
    _ => StorageError::Unavailable(e.to_string()),
  }
}

impl KeyValueStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(map_sqlite_error)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(map_sqlite_error)?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<bool, StorageError> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(map_sqlite_error)?;
    Ok(removed > 0)
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
    let conn = self.lock()?;
    // substr comparison rather than LIKE, so '%' and '_' in keys stay literal
    let mut stmt = conn
      .prepare(
        "SELECT key FROM kv_store
         WHERE substr(key, 1, length(?1)) = ?1
         ORDER BY key",
      )
      .map_err(map_sqlite_error)?;

    let keys = stmt
      .query_map(params![prefix], |row| row.get::<_, String>(0))
      .map_err(map_sqlite_error)?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}

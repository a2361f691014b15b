//! Blob key-value stores backing the durable persister.

use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::Database;
use crate::error::{CacheError, Result};

/// Blob-oriented key-value store.
pub trait KvStore: Send + Sync {
  /// Prepare the store for use. Called once during bootstrap; stores that
  /// open lazily may treat it as a no-op.
  fn init(&self) -> Result<()> {
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  fn delete(&self, key: &str) -> Result<()>;

  fn keys(&self) -> Result<Vec<String>>;

  /// Keys starting with `prefix`.
  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    Ok(
      self
        .keys()?
        .into_iter()
        .filter(|k| k.starts_with(prefix))
        .collect(),
    )
  }

  /// Remove every record.
  fn clear(&self) -> Result<()>;
}

/// Key-value store in the `kv` table of the local SQLite database.
pub struct SqliteStore {
  db: Arc<Database>,
}

impl SqliteStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl KvStore for SqliteStore {
  fn init(&self) -> Result<()> {
    self.db.open()
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.db.with_conn(|conn| {
      conn
        .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
          row.get(0)
        })
        .optional()
    })
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    self.db.with_conn(|conn| {
      conn.execute(
        "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
    })?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self
      .db
      .with_conn(|conn| conn.execute("DELETE FROM kv WHERE key = ?", params![key]))?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
      let keys = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(keys)
    })
  }

  fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
    self.db.with_conn(|conn| {
      // substr avoids LIKE wildcard escaping for prefixes containing '_'
      let mut stmt =
        conn.prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")?;
      let keys = stmt
        .query_map(params![prefix], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(keys)
    })
  }

  fn clear(&self) -> Result<()> {
    self
      .db
      .with_conn(|conn| conn.execute("DELETE FROM kv", []))?;
    Ok(())
  }
}

/// Store that keeps everything in process memory.
///
/// Used when persistence is disabled and in tests.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
    self
      .entries
      .lock()
      .map_err(|e| CacheError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl KvStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    self.lock()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn clear(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }
}

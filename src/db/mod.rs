pub mod schema;
mod store;

pub use store::{KvStore, MemoryStore, SqliteStore};

use async_trait::async_trait;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::error::{CacheError, Result};

/// The embedded local database, as seen by application bootstrap.
#[async_trait]
pub trait LocalDatabase: Send + Sync {
  /// Open the database and bring its schema up to date. Must be idempotent.
  async fn init(&self) -> Result<()>;
}

/// SQLite database wrapper.
///
/// The connection is opened lazily on first use, so constructing a
/// `Database` never touches the filesystem.
pub struct Database {
  path: PathBuf,
  conn: Mutex<Option<Connection>>,
}

impl Database {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      conn: Mutex::new(None),
    }
  }

  /// Database at the default location.
  pub fn at_default_path() -> Result<Self> {
    Ok(Self::new(Self::default_path()?))
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| CacheError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("vaultcache").join("cache.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Open the connection if needed and run migrations.
  pub fn open(&self) -> Result<()> {
    self.with_conn(|_| Ok(()))
  }

  /// Run `f` against the open connection, opening it first if necessary.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| CacheError::Storage(format!("Lock poisoned: {}", e)))?;

    if guard.is_none() {
      *guard = Some(self.connect()?);
    }

    match guard.as_ref() {
      Some(conn) => Ok(f(conn)?),
      None => Err(CacheError::Storage("Database is not open".to_string())),
    }
  }

  fn connect(&self) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Storage(format!(
          "Failed to create database directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(&self.path).map_err(|e| {
      CacheError::Storage(format!(
        "Failed to open database at {}: {}",
        self.path.display(),
        e
      ))
    })?;

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| CacheError::Storage(format!("Failed to run migrations: {}", e)))?;

    info!(path = %self.path.display(), "Opened local database");
    Ok(conn)
  }
}

#[async_trait]
impl LocalDatabase for Database {
  async fn init(&self) -> Result<()> {
    self.open()
  }
}

//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::Cacheable;

/// A single cached record.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached record
  pub entity: T,
  /// When the record was last written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every operation is partitioned by a `scope_key` identifying one account on one server.
pub trait CacheStorage: Send + Sync {
  /// Upsert records by key in one atomic write. Later copies replace earlier ones.
  fn merge_entities<T: Cacheable>(&self, scope_key: &str, entities: &[T]) -> Result<()>;

  /// All cached records of a type, newest first.
  fn load_entities<T: Cacheable>(&self, scope_key: &str) -> Result<Vec<T>>;

  /// Get a single record by key.
  fn get_entity<T: Cacheable>(&self, scope_key: &str, entity_key: &str)
    -> Result<Option<CachedEntity<T>>>;

  /// Read, modify and write back one record atomically with respect to merges.
  /// Returns false if the record is not cached.
  fn update_entity<T, F>(&self, scope_key: &str, entity_key: &str, update: F) -> Result<bool>
  where
    T: Cacheable,
    F: FnOnce(&mut T);

  /// Record when a type was last fully refreshed.
  fn set_last_synced(&self, scope_key: &str, entity_type: &str, at: DateTime<Utc>)
    -> Result<()>;

  fn get_last_synced(&self, scope_key: &str, entity_type: &str) -> Result<Option<DateTime<Utc>>>;

  /// Drop every record and sync marker for a partition.
  fn clear_scope(&self, scope_key: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
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

    Ok(data_dir.join("paysync").join("cache.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Cached records (serialized JSON), one partition per account
CREATE TABLE IF NOT EXISTS record_cache (
    scope_key TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    sort_key INTEGER NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_key, entity_type, entity_key)
);

CREATE INDEX IF NOT EXISTS idx_record_cache_order
    ON record_cache(scope_key, entity_type, sort_key DESC);

-- Last successful refresh per partition and type
CREATE TABLE IF NOT EXISTS sync_state (
    scope_key TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    last_synced_at TEXT NOT NULL,
    PRIMARY KEY (scope_key, entity_type)
);
"#;

impl CacheStorage for SqliteStorage {
  fn merge_entities<T: Cacheable>(&self, scope_key: &str, entities: &[T]) -> Result<()> {
    let mut conn = self.lock()?;
    let entity_type = T::entity_type();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entity in entities {
      let entity_key = entity.cache_key();

      let previous: Option<Vec<u8>> = tx
        .query_row(
          "SELECT data FROM record_cache
           WHERE scope_key = ? AND entity_type = ? AND entity_key = ?",
          params![scope_key, entity_type, entity_key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read cached record: {}", e))?;

      let mut incoming = entity.clone();
      if let Some(previous) = previous.and_then(|data| serde_json::from_slice::<T>(&data).ok()) {
        incoming.reconcile(&previous);
      }

      let data =
        serde_json::to_vec(&incoming).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

      tx.execute(
        "INSERT OR REPLACE INTO record_cache (scope_key, entity_type, entity_key, data, sort_key, cached_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![scope_key, entity_type, entity_key, data, incoming.sort_key()],
      )
      .map_err(|e| eyre!("Failed to store record: {}", e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn load_entities<T: Cacheable>(&self, scope_key: &str) -> Result<Vec<T>> {
    let conn = self.lock()?;
    let entity_type = T::entity_type();

    let mut stmt = conn
      .prepare(
        "SELECT entity_key, data FROM record_cache
         WHERE scope_key = ? AND entity_type = ?
         ORDER BY sort_key DESC, entity_key ASC",
      )
      .map_err(|e| eyre!("Failed to prepare record query: {}", e))?;

    let rows = stmt
      .query_map(params![scope_key, entity_type], |row| {
        let entity_key: String = row.get(0)?;
        let data: Vec<u8> = row.get(1)?;
        Ok((entity_key, data))
      })
      .map_err(|e| eyre!("Failed to query records: {}", e))?;

    let mut entities = Vec::new();
    for row in rows {
      let (entity_key, data) = row.map_err(|e| eyre!("Failed to read record row: {}", e))?;
      match serde_json::from_slice::<T>(&data) {
        Ok(entity) => entities.push(entity),
        Err(e) => warn!(
          entity_type,
          entity_key = %entity_key,
          error = %e,
          "Skipping undecodable cached record"
        ),
      }
    }

    Ok(entities)
  }

  fn get_entity<T: Cacheable>(
    &self,
    scope_key: &str,
    entity_key: &str,
  ) -> Result<Option<CachedEntity<T>>> {
    let conn = self.lock()?;
    let entity_type = T::entity_type();

    let result: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM record_cache
         WHERE scope_key = ? AND entity_type = ? AND entity_key = ?",
        params![scope_key, entity_type, entity_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query record: {}", e))?;

    match result {
      Some((data, cached_at_str)) => {
        let entity: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize record: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntity { entity, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn update_entity<T, F>(&self, scope_key: &str, entity_key: &str, update: F) -> Result<bool>
  where
    T: Cacheable,
    F: FnOnce(&mut T),
  {
    let mut conn = self.lock()?;
    let entity_type = T::entity_type();

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current: Option<Vec<u8>> = tx
      .query_row(
        "SELECT data FROM record_cache
         WHERE scope_key = ? AND entity_type = ? AND entity_key = ?",
        params![scope_key, entity_type, entity_key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cached record: {}", e))?;

    let Some(current) = current else {
      return Ok(false);
    };

    let mut entity: T = serde_json::from_slice(&current)
      .map_err(|e| eyre!("Failed to deserialize record: {}", e))?;
    update(&mut entity);
    let data =
      serde_json::to_vec(&entity).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

    tx.execute(
      "UPDATE record_cache SET data = ?, sort_key = ?, cached_at = datetime('now')
       WHERE scope_key = ? AND entity_type = ? AND entity_key = ?",
      params![data, entity.sort_key(), scope_key, entity_type, entity_key],
    )
    .map_err(|e| eyre!("Failed to update record: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(true)
  }

  fn set_last_synced(
    &self,
    scope_key: &str,
    entity_type: &str,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO sync_state (scope_key, entity_type, last_synced_at)
         VALUES (?, ?, ?)",
        params![scope_key, entity_type, at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to update sync state: {}", e))?;

    Ok(())
  }

  fn get_last_synced(&self, scope_key: &str, entity_type: &str) -> Result<Option<DateTime<Utc>>> {
    let conn = self.lock()?;

    let result: Option<String> = conn
      .query_row(
        "SELECT last_synced_at FROM sync_state WHERE scope_key = ? AND entity_type = ?",
        params![scope_key, entity_type],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query sync state: {}", e))?;

    result
      .map(|s| {
        DateTime::parse_from_rfc3339(&s)
          .map(|dt| dt.with_timezone(&Utc))
          .map_err(|e| eyre!("Failed to parse sync timestamp '{}': {}", s, e))
      })
      .transpose()
  }

  fn clear_scope(&self, scope_key: &str) -> Result<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
    tx.execute(
      "DELETE FROM record_cache WHERE scope_key = ?",
      params![scope_key],
    )
    .map_err(|e| eyre!("Failed to clear cached records: {}", e))?;
    tx.execute("DELETE FROM sync_state WHERE scope_key = ?", params![scope_key])
      .map_err(|e| eyre!("Failed to clear sync state: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::{CachedEntry, Response};

/// Trait for cache storage backends.
///
/// Entries live in named caches (one per partition and version) and keep the
/// order they were first inserted in.
pub trait CacheStorage: Send + Sync {
  /// Get a cached response by key.
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>>;

  /// Insert or refresh an entry, then evict oldest-inserted entries until at
  /// most `max` remain. Both happen atomically; returns how many were evicted.
  ///
  /// A refresh keeps the original insertion position.
  fn insert_bounded(
    &self,
    cache: &str,
    key: &str,
    url: &str,
    response: &Response,
    max: usize,
  ) -> Result<usize>;

  /// Number of entries in a cache.
  fn len(&self, cache: &str) -> Result<usize>;

  /// Names of every cache holding at least one entry.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Drop a whole cache.
  fn delete_cache(&self, cache: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _cache: &str, _key: &str) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn insert_bounded(
    &self,
    _cache: &str,
    _key: &str,
    _url: &str,
    _response: &Response,
    _max: usize,
  ) -> Result<usize> {
    Ok(0) // Discard
  }

  fn len(&self, _cache: &str) -> Result<usize> {
    Ok(0)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete_cache(&self, _cache: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- seq records first insertion and drives FIFO eviction
CREATE TABLE IF NOT EXISTS cache_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    cache_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (cache_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_order
    ON cache_entries(cache_name, seq);
"#;

impl CacheStorage for SqliteCacheStorage {
  fn get(&self, cache: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;

    let row: Option<(u16, Option<String>, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, content_type, body, cached_at FROM cache_entries
         WHERE cache_name = ? AND entry_key = ?",
        params![cache, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, content_type, body, cached_at)) => Ok(Some(CachedEntry {
        response: Response {
          status,
          content_type,
          body,
        },
        cached_at: parse_datetime(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn insert_bounded(
    &self,
    cache: &str,
    key: &str,
    url: &str,
    response: &Response,
    max: usize,
  ) -> Result<usize> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin cache write: {}", e))?;

    tx.execute(
      "INSERT INTO cache_entries (cache_name, entry_key, url, status, content_type, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
       ON CONFLICT (cache_name, entry_key) DO UPDATE SET
         status = excluded.status,
         content_type = excluded.content_type,
         body = excluded.body,
         cached_at = excluded.cached_at",
      params![
        cache,
        key,
        url,
        response.status,
        response.content_type,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    let evicted = tx
      .execute(
        "DELETE FROM cache_entries
         WHERE cache_name = ?1 AND seq NOT IN (
           SELECT seq FROM cache_entries WHERE cache_name = ?1
           ORDER BY seq DESC LIMIT ?2
         )",
        params![cache, max as i64],
      )
      .map_err(|e| eyre!("Failed to evict cache entries: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache write: {}", e))?;

    Ok(evicted)
  }

  fn len(&self, cache: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![cache],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as usize)
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT cache_name FROM cache_entries ORDER BY cache_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
      .map_err(|e| eyre!("Failed to list caches: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, cache: &str) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_name = ?",
        params![cache],
      )
      .map_err(|e| eyre!("Failed to delete cache {}: {}", cache, e))
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

//! SQLite-backed record store.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::schema::{self, SCHEMA_VERSION};
use super::types::{Domain, Record, RecordId, Status};
use super::{RecordStore, Result, StoreError};

const RECORD_COLUMNS: &str = "id, domain, payload, timestamp, status, owner_id, synced_at, error";

/// Record store persisted in a single SQLite database.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  /// Owner stamped onto every new record
  owner_id: String,
}

impl SqliteStore {
  /// Open (or create) the store at `path`, migrating it to the current schema.
  pub fn open(path: &Path, owner_id: impl Into<String>) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| StoreError::storage("Failed to create store directory", e))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      StoreError::storage(&format!("Failed to open store at {}", path.display()), e)
    })?;

    Self::with_connection(conn, owner_id.into())
  }

  /// Open a throwaway store that lives only as long as the process.
  pub fn open_in_memory(owner_id: impl Into<String>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| StoreError::storage("Failed to open in-memory store", e))?;
    Self::with_connection(conn, owner_id.into())
  }

  fn with_connection(mut conn: Connection, owner_id: String) -> Result<Self> {
    run_migrations(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
      owner_id,
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::storage("Lock poisoned", e))
  }
}

/// Create missing partitions and indexes, then record the schema version.
///
/// A database already at `SCHEMA_VERSION` is left untouched.
fn run_migrations(conn: &mut Connection) -> Result<()> {
  let version: i64 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| StoreError::storage("Failed to read schema version", e))?;

  if version > SCHEMA_VERSION {
    return Err(StoreError::Storage(format!(
      "Store schema version {} is newer than supported version {}",
      version, SCHEMA_VERSION
    )));
  }

  if version == SCHEMA_VERSION {
    debug!(version, "Store schema up to date");
    return Ok(());
  }

  let tx = conn
    .transaction()
    .map_err(|e| StoreError::storage("Failed to begin migration", e))?;

  tx.execute_batch(&schema::schema())
    .map_err(|e| StoreError::storage("Failed to run store migrations", e))?;
  tx.pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| StoreError::storage("Failed to write schema version", e))?;

  tx.commit()
    .map_err(|e| StoreError::storage("Failed to commit migration", e))?;

  info!(from = version, to = SCHEMA_VERSION, "Migrated record store");
  Ok(())
}

impl RecordStore for SqliteStore {
  fn add(&self, domain: Domain, payload: Value) -> Result<Record> {
    let conn = self.conn()?;
    let timestamp = now_millis();
    let data = serde_json::to_string(&payload)
      .map_err(|e| StoreError::storage("Failed to serialize payload", e))?;

    conn
      .execute(
        &format!(
          "INSERT INTO {} (domain, payload, timestamp, status, owner_id)
           VALUES (?, ?, ?, ?, ?)",
          domain.table()
        ),
        params![
          domain.as_str(),
          data,
          format_time(&timestamp),
          Status::Pending.as_str(),
          self.owner_id
        ],
      )
      .map_err(|e| StoreError::storage("Failed to insert record", e))?;

    let id = conn.last_insert_rowid();
    debug!(%domain, id, "Queued record");

    Ok(Record {
      id,
      domain,
      payload,
      timestamp,
      status: Status::Pending,
      owner_id: self.owner_id.clone(),
      synced_at: None,
      error: None,
    })
  }

  fn get(&self, domain: Domain, id: RecordId) -> Result<Option<Record>> {
    let conn = self.conn()?;
    fetch_one(&conn, domain, id)
  }

  fn get_all(&self, domain: Domain) -> Result<Vec<Record>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM {} ORDER BY id",
        RECORD_COLUMNS,
        domain.table()
      ))
      .map_err(|e| StoreError::storage("Failed to prepare query", e))?;

    let raw = stmt
      .query_map([], RawRecord::from_row)
      .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
      .map_err(|e| StoreError::storage("Failed to query records", e))?;

    raw.into_iter().map(RawRecord::into_record).collect()
  }

  fn get_by_status(&self, domain: Domain, status: Status) -> Result<Vec<Record>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM {} WHERE status = ? ORDER BY id",
        RECORD_COLUMNS,
        domain.table()
      ))
      .map_err(|e| StoreError::storage("Failed to prepare query", e))?;

    let raw = stmt
      .query_map(params![status.as_str()], RawRecord::from_row)
      .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
      .map_err(|e| StoreError::storage("Failed to query records by status", e))?;

    raw.into_iter().map(RawRecord::into_record).collect()
  }

  fn update_status(
    &self,
    domain: Domain,
    id: RecordId,
    status: Status,
    error: Option<&str>,
  ) -> Result<Record> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| StoreError::storage("Failed to begin transaction", e))?;

    let mut record = fetch_one(&tx, domain, id)?.ok_or(StoreError::NotFound { domain, id })?;

    record.status = status;
    record.synced_at = Some(now_millis());
    record.error = match status {
      Status::Failed => Some(error.unwrap_or("unknown error").to_string()),
      _ => None,
    };

    tx.execute(
      &format!(
        "UPDATE {} SET status = ?, synced_at = ?, error = ? WHERE id = ?",
        domain.table()
      ),
      params![
        status.as_str(),
        record.synced_at.as_ref().map(format_time),
        record.error,
        id
      ],
    )
    .map_err(|e| StoreError::storage("Failed to update record status", e))?;

    tx.commit()
      .map_err(|e| StoreError::storage("Failed to commit status update", e))?;

    Ok(record)
  }

  fn delete(&self, domain: Domain, id: RecordId) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute(
        &format!("DELETE FROM {} WHERE id = ?", domain.table()),
        params![id],
      )
      .map_err(|e| StoreError::storage("Failed to delete record", e))?;
    Ok(removed > 0)
  }

  fn clear(&self, domain: Domain) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(&format!("DELETE FROM {}", domain.table()), [])
      .map_err(|e| StoreError::storage("Failed to clear domain", e))
  }

  fn count(&self, domain: Domain, status: Option<Status>) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = match status {
      Some(status) => conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE status = ?", domain.table()),
        params![status.as_str()],
        |row| row.get(0),
      ),
      None => conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", domain.table()),
        [],
        |row| row.get(0),
      ),
    }
    .map_err(|e| StoreError::storage("Failed to count records", e))?;

    Ok(count as usize)
  }

  fn purge_synced_before(&self, domain: Domain, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    conn
      .execute(
        &format!(
          "DELETE FROM {} WHERE status = ? AND timestamp < ?",
          domain.table()
        ),
        params![Status::Synced.as_str(), format_time(&cutoff)],
      )
      .map_err(|e| StoreError::storage("Failed to purge synced records", e))
  }

  fn acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
    let now = now_millis();
    let expires_at = TimeDelta::from_std(ttl)
      .ok()
      .and_then(|ttl| now.checked_add_signed(ttl))
      .ok_or_else(|| StoreError::Storage(format!("Lease duration {:?} out of range", ttl)))?;

    let conn = self.conn()?;
    // One statement, so the check and the claim can't interleave with another
    // connection
    let claimed = conn
      .execute(
        "INSERT INTO sync_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
         ON CONFLICT (id) DO UPDATE SET
           holder = excluded.holder,
           expires_at = excluded.expires_at
         WHERE sync_lease.holder = excluded.holder OR sync_lease.expires_at <= ?3",
        params![holder, format_time(&expires_at), format_time(&now)],
      )
      .map_err(|e| StoreError::storage("Failed to claim sync lease", e))?;

    Ok(claimed > 0)
  }

  fn release_sync_lease(&self, holder: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM sync_lease WHERE id = 1 AND holder = ?",
        params![holder],
      )
      .map_err(|e| StoreError::storage("Failed to release sync lease", e))?;
    Ok(())
  }
}

fn fetch_one(conn: &Connection, domain: Domain, id: RecordId) -> Result<Option<Record>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {} FROM {} WHERE id = ?",
        RECORD_COLUMNS,
        domain.table()
      ),
      params![id],
      RawRecord::from_row,
    )
    .optional()
    .map_err(|e| StoreError::storage("Failed to read record", e))?;

  raw.map(RawRecord::into_record).transpose()
}

/// Row as stored, before text columns are parsed.
struct RawRecord {
  id: RecordId,
  domain: String,
  payload: String,
  timestamp: String,
  status: String,
  owner_id: String,
  synced_at: Option<String>,
  error: Option<String>,
}

impl RawRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      domain: row.get(1)?,
      payload: row.get(2)?,
      timestamp: row.get(3)?,
      status: row.get(4)?,
      owner_id: row.get(5)?,
      synced_at: row.get(6)?,
      error: row.get(7)?,
    })
  }

  fn into_record(self) -> Result<Record> {
    Ok(Record {
      id: self.id,
      domain: self.domain.parse().map_err(StoreError::Storage)?,
      payload: serde_json::from_str(&self.payload)
        .map_err(|e| StoreError::storage("Failed to deserialize payload", e))?,
      timestamp: parse_time(&self.timestamp)?,
      status: self.status.parse().map_err(StoreError::Storage)?,
      owner_id: self.owner_id,
      synced_at: self.synced_at.as_deref().map(parse_time).transpose()?,
      error: self.error,
    })
  }
}

/// Current time truncated to what the store persists.
fn now_millis() -> DateTime<Utc> {
  let now = Utc::now();
  DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

fn format_time(t: &DateTime<Utc>) -> String {
  t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::storage(&format!("Failed to parse timestamp '{}'", s), e))
}

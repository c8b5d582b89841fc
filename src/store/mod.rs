//! Durable local store for queued floor operations.
//!
//! Records live in one SQLite partition per domain, each carrying indexes on
//! `timestamp`, `domain`, `status` and `owner_id`. Writes are visible to the
//! next read immediately; there is no write-behind buffer.

mod error;
pub mod schema;
mod sqlite;
mod types;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::time::Duration;

pub use error::StoreError;
pub use sqlite::SqliteStore;
pub use types::{Domain, Record, RecordId, Status};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage backend for queued records.
pub trait RecordStore: Send + Sync {
  /// Persist a new `Pending` record owned by the current user.
  fn add(&self, domain: Domain, payload: Value) -> Result<Record>;

  /// Fetch a single record.
  fn get(&self, domain: Domain, id: RecordId) -> Result<Option<Record>>;

  /// Every record in the domain, in storage order.
  fn get_all(&self, domain: Domain) -> Result<Vec<Record>>;

  /// `get_all` narrowed by an in-memory predicate applied after retrieval.
  fn get_all_matching<P>(&self, domain: Domain, predicate: P) -> Result<Vec<Record>>
  where
    P: Fn(&Record) -> bool,
  {
    Ok(
      self
        .get_all(domain)?
        .into_iter()
        .filter(|r| predicate(r))
        .collect(),
    )
  }

  /// Records with the given status, served from the status index.
  fn get_by_status(&self, domain: Domain, status: Status) -> Result<Vec<Record>>;

  /// Move a record to `status`, stamping `synced_at`. `error` is kept only for
  /// `Failed` and cleared otherwise.
  fn update_status(
    &self,
    domain: Domain,
    id: RecordId,
    status: Status,
    error: Option<&str>,
  ) -> Result<Record>;

  /// Returns whether a record was removed.
  fn delete(&self, domain: Domain, id: RecordId) -> Result<bool>;

  /// Remove every record in the domain, returning how many were dropped.
  fn clear(&self, domain: Domain) -> Result<usize>;

  fn count(&self, domain: Domain, status: Option<Status>) -> Result<usize>;

  /// Retention sweep: drop `Synced` records created before `cutoff`.
  fn purge_synced_before(&self, domain: Domain, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Claim the store-wide sync lease for `holder` until `ttl` from now.
  ///
  /// Succeeds when the lease is free, expired, or already held by `holder`, in
  /// which case it is extended. Every process opening the same store sees the
  /// same lease.
  fn acquire_sync_lease(&self, holder: &str, ttl: Duration) -> Result<bool>;

  /// Give the lease up if `holder` still owns it.
  fn release_sync_lease(&self, holder: &str) -> Result<()>;
}

/// Drop `Synced` records older than `days` from every domain.
pub fn purge_expired<S: RecordStore + ?Sized>(
  store: &S,
  days: u32,
  now: DateTime<Utc>,
) -> Result<usize> {
  let cutoff = TimeDelta::try_days(i64::from(days))
    .and_then(|window| now.checked_sub_signed(window))
    .ok_or(StoreError::RetentionOutOfRange { days })?;

  let mut purged = 0;
  for domain in Domain::ALL {
    purged += store.purge_synced_before(domain, cutoff)?;
  }
  Ok(purged)
}

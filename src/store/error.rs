use std::fmt::Display;
use thiserror::Error;

use super::types::{Domain, RecordId};

#[derive(Debug, Error)]
pub enum StoreError {
  /// Engine could not be opened, read, written or migrated
  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Record {id} not found in {domain}")]
  NotFound { domain: Domain, id: RecordId },

  /// Another process took the sync lease over mid-pass
  #[error("Sync lease lost to another process")]
  LeaseLost,

  #[error("Retention window of {days} days is out of range")]
  RetentionOutOfRange { days: u32 },
}

impl StoreError {
  pub(crate) fn storage(context: &str, err: impl Display) -> Self {
    StoreError::Storage(format!("{}: {}", context, err))
  }
}

//! Drains queued records to the remote system.
//!
//! A pass visits every domain in a fixed order, submits each pending record
//! and records the outcome on the record itself. One failing record never
//! stops the rest of the pass.

mod agent;
mod orchestrator;
mod submit;

use serde::Serialize;
use std::collections::BTreeMap;

use crate::store::Domain;

pub use agent::run_sync_agent;
pub use orchestrator::SyncOrchestrator;
pub use submit::Submitters;

/// Per-domain tally for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DomainResult {
  pub synced: usize,
  pub failed: usize,
  pub total: usize,
}

/// Aggregate outcome of a completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
  pub per_domain: BTreeMap<Domain, DomainResult>,
}

impl SyncSummary {
  pub fn synced(&self) -> usize {
    self.per_domain.values().map(|r| r.synced).sum()
  }

  pub fn failed(&self) -> usize {
    self.per_domain.values().map(|r| r.failed).sum()
  }

  pub fn total(&self) -> usize {
    self.per_domain.values().map(|r| r.total).sum()
  }
}

/// Lifecycle notifications broadcast to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  Started,
  Completed(SyncSummary),
  /// Pass aborted by something other than a record-level submit failure
  Failed { error: String },
}

/// What a call to `sync_all` ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// Another pass was already running
  Skipped,
  Completed(SyncSummary),
  Failed(String),
}

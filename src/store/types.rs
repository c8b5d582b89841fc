use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Store-assigned record identifier, unique within a domain
pub type RecordId = i64;

/// Partition a record is queued under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
  Scan,
  Receipt,
  Pick,
  Count,
  Shipment,
  /// Generic queue for operations that don't belong to a floor workflow
  SyncQueue,
}

impl Domain {
  /// Every domain, in the order sync passes visit them.
  pub const ALL: [Domain; 6] = [
    Domain::Scan,
    Domain::Receipt,
    Domain::Pick,
    Domain::Count,
    Domain::Shipment,
    Domain::SyncQueue,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Domain::Scan => "scan",
      Domain::Receipt => "receipt",
      Domain::Pick => "pick",
      Domain::Count => "count",
      Domain::Shipment => "shipment",
      Domain::SyncQueue => "sync_queue",
    }
  }

  /// Name of the table backing this partition
  pub(crate) fn table(&self) -> &'static str {
    match self {
      Domain::Scan => "scan_records",
      Domain::Receipt => "receipt_records",
      Domain::Pick => "pick_records",
      Domain::Count => "count_records",
      Domain::Shipment => "shipment_records",
      Domain::SyncQueue => "sync_queue",
    }
  }
}

impl fmt::Display for Domain {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Domain {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "scan" | "scans" => Ok(Domain::Scan),
      "receipt" | "receipts" => Ok(Domain::Receipt),
      "pick" | "picks" => Ok(Domain::Pick),
      "count" | "counts" => Ok(Domain::Count),
      "shipment" | "shipments" => Ok(Domain::Shipment),
      "sync_queue" | "queue" => Ok(Domain::SyncQueue),
      other => Err(format!("unknown domain '{}'", other)),
    }
  }
}

/// Delivery state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Pending,
  Synced,
  Failed,
}

impl Status {
  pub fn as_str(&self) -> &'static str {
    match self {
      Status::Pending => "pending",
      Status::Synced => "synced",
      Status::Failed => "failed",
    }
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Status {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "pending" => Ok(Status::Pending),
      "synced" => Ok(Status::Synced),
      "failed" => Ok(Status::Failed),
      other => Err(format!("unknown status '{}'", other)),
    }
  }
}

/// One queued operation awaiting delivery upstream.
///
/// `id`, `domain`, `timestamp` and `owner_id` are fixed at creation. The
/// remaining fields only change through `RecordStore::update_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: RecordId,
  pub domain: Domain,
  pub payload: Value,
  pub timestamp: DateTime<Utc>,
  pub status: Status,
  pub owner_id: String,
  pub synced_at: Option<DateTime<Utc>>,
  /// Last failure message, only set while `status` is `Failed`
  pub error: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_domain_parse_accepts_plural_and_case() {
    assert_eq!("Receipts".parse::<Domain>(), Ok(Domain::Receipt));
    assert_eq!("queue".parse::<Domain>(), Ok(Domain::SyncQueue));
    assert!("pallet".parse::<Domain>().is_err());
  }

  #[test]
  fn test_status_serializes_lowercase() {
    let json = serde_json::to_string(&Status::Failed).unwrap();
    assert_eq!(json, "\"failed\"");
  }

  #[test]
  fn test_tables_are_distinct() {
    let mut tables: Vec<_> = Domain::ALL.iter().map(|d| d.table()).collect();
    tables.sort();
    tables.dedup();
    assert_eq!(tables.len(), Domain::ALL.len());
  }
}

use super::types::Domain;

/// Bumped whenever partitions or indexes change. Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 3;

/// DDL for one partition and its four indexes. Safe to run repeatedly.
pub fn partition_ddl(domain: Domain) -> String {
  let table = domain.table();
  format!(
    r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    owner_id TEXT NOT NULL,
    synced_at TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_{table}_timestamp ON {table}(timestamp);
CREATE INDEX IF NOT EXISTS idx_{table}_domain ON {table}(domain);
CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);
CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner_id);
"#
  )
}

/// Single-row lease naming whoever is currently running a sync pass.
pub const SYNC_LEASE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS sync_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

/// Full schema for the current version
pub fn schema() -> String {
  let mut ddl: String = Domain::ALL.iter().map(|d| partition_ddl(*d)).collect();
  ddl.push_str(SYNC_LEASE_DDL);
  ddl
}

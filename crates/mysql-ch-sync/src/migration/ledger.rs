//! Ledger storage for migration attempts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::Lifecycle;
use crate::error::{Result, SyncError};

/// Name of the ledger table in the destination database.
pub const LEDGER_TABLE: &str = "_mysql_ch_sync_migrations";

/// Status of one ledger entry.
///
/// Ordered so that a terminal status sorts after `Start`, which breaks ties
/// between entries written in the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Start,
    Success,
    Failure,
}

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub alias: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub lifecycle: Lifecycle,
    pub status: LedgerStatus,
    pub elapsed: Duration,
    /// Checksum of the migration query text.
    pub checksum: String,
}

/// Persistence for the migration ledger.
///
/// Implementations never update or delete entries.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the ledger if it does not exist. Idempotent.
    async fn ensure_ledger(&self) -> Result<()>;

    /// Most recent entry for `(alias, version)`.
    async fn latest_entry(&self, alias: &str, version: &str) -> Result<Option<LedgerEntry>>;

    /// Append an entry.
    async fn append_entry(&self, entry: &LedgerEntry) -> Result<()>;

    /// Execute migration DDL.
    async fn apply_ddl(&self, sql: &str) -> Result<()>;
}

/// Convert a LedgerStatus to its stored representation.
pub fn ledger_status_to_str(status: LedgerStatus) -> &'static str {
    match status {
        LedgerStatus::Start => "start",
        LedgerStatus::Success => "success",
        LedgerStatus::Failure => "failure",
    }
}

/// Parse a stored LedgerStatus.
pub fn str_to_ledger_status(s: &str) -> Result<LedgerStatus> {
    match s {
        "start" => Ok(LedgerStatus::Start),
        "success" => Ok(LedgerStatus::Success),
        "failure" => Ok(LedgerStatus::Failure),
        _ => Err(SyncError::destination(format!("Invalid ledger status: {}", s))),
    }
}

//! Migration ledger stored in ClickHouse.

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use std::time::Duration;

use super::client::ClickHouseClient;
use super::sql::{self, lenient_u64};
use crate::config::Lifecycle;
use crate::core::identifier::qualify;
use crate::core::traits::DestinationStore;
use crate::error::{Result, SyncError};
use crate::migration::{
    ledger_status_to_str, str_to_ledger_status, LedgerEntry, LedgerStore, LEDGER_TABLE,
};

#[derive(Debug, Deserialize)]
struct LedgerRow {
    alias: String,
    version: String,
    timestamp_ms: i64,
    lifecycle: Lifecycle,
    status: String,
    #[serde(deserialize_with = "lenient_u64")]
    elapsed_ms: u64,
    checksum: String,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = SyncError;

    fn try_from(row: LedgerRow) -> Result<Self> {
        let timestamp = DateTime::from_timestamp_millis(row.timestamp_ms).ok_or_else(|| {
            SyncError::destination(format!("invalid ledger timestamp {}", row.timestamp_ms))
        })?;
        Ok(LedgerEntry {
            alias: row.alias,
            version: row.version,
            timestamp,
            lifecycle: row.lifecycle,
            status: str_to_ledger_status(&row.status)?,
            elapsed: Duration::from_millis(row.elapsed_ms),
            checksum: row.checksum,
        })
    }
}

#[async_trait]
impl LedgerStore for ClickHouseClient {
    async fn ensure_ledger(&self) -> Result<()> {
        self.execute(&sql::create_ledger_sql(self.database())?).await
    }

    async fn latest_entry(&self, alias: &str, version: &str) -> Result<Option<LedgerEntry>> {
        let query = format!(
            "SELECT alias, version, toUnixTimestamp64Milli(timestamp) AS timestamp_ms, \
             toString(lifecycle) AS lifecycle, toString(status) AS status, elapsed_ms, checksum \
             FROM {} WHERE alias = {{alias:String}} AND version = {{version:String}} \
             ORDER BY timestamp DESC, status DESC LIMIT 1",
            qualify(self.database(), LEDGER_TABLE)?
        );
        let rows: Vec<LedgerRow> = self
            .fetch_rows(&query, &[("alias", alias), ("version", version)])
            .await?;
        rows.into_iter().next().map(LedgerEntry::try_from).transpose()
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (alias, version, timestamp, lifecycle, status, elapsed_ms, checksum) \
             SELECT {{alias:String}}, {{version:String}}, \
             fromUnixTimestamp64Milli(toInt64({{ts:String}}), 'UTC'), \
             {{lifecycle:String}}, {{status:String}}, toUInt64({{elapsed:String}}), {{checksum:String}}",
            qualify(self.database(), LEDGER_TABLE)?
        );
        let ts = entry.timestamp.timestamp_millis().to_string();
        let elapsed = entry.elapsed.as_millis().to_string();
        self.fetch_text(
            &query,
            &[
                ("alias", entry.alias.as_str()),
                ("version", entry.version.as_str()),
                ("ts", ts.as_str()),
                ("lifecycle", entry.lifecycle.as_str()),
                ("status", ledger_status_to_str(entry.status)),
                ("elapsed", elapsed.as_str()),
                ("checksum", entry.checksum.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn apply_ddl(&self, sql: &str) -> Result<()> {
        self.execute(sql).await
    }
}

//! Store capabilities consumed by the transfer engine.
//!
//! - [`SourceStore`]: describes the extraction query and manages the transient
//!   extraction view on MySQL
//! - [`DestinationStore`]: DDL, point queries, table identity swaps and the
//!   streaming insert-select on ClickHouse
//!
//! One engine invocation owns one value of each for its whole lifetime.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

use super::schema::{ColumnDescriptor, ColumnMapping, SourceLink, TableStats};

/// Progress snapshot handed to the progress callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Cumulative rows read from the extraction view.
    pub read_rows: u64,
    /// Cumulative bytes read.
    pub read_bytes: u64,
    /// Server estimate of total rows, 0 when unknown.
    pub total_rows_approx: u64,
    /// Time since the insert-select started.
    pub elapsed: Duration,
}

/// Callback verdict after each progress tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    Stop,
}

/// Progress callback, invoked on the transfer's own task.
pub type ProgressCallback<'a> = &'a mut (dyn FnMut(&TransferProgress) -> ProgressControl + Send);

/// Outcome of a streaming insert-select.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamResult {
    /// Last reported cumulative row count.
    pub rows: u64,
    /// True when the callback asked to stop before completion.
    pub stopped: bool,
}

/// The row-oriented store the data is read from.
#[async_trait]
pub trait SourceStore: Send {
    /// Connection details the destination uses to reach this store.
    fn link(&self) -> &SourceLink;

    /// Describe the result columns of `query` without reading any rows.
    async fn describe_query(&mut self, query: &str) -> Result<Vec<ColumnDescriptor>>;

    /// Create (or replace) a view over `select`.
    async fn create_view(&mut self, view: &str, select: &str) -> Result<()>;

    /// Drop a view if it exists.
    async fn drop_view(&mut self, view: &str) -> Result<()>;
}

/// The column-oriented store the data is written to.
///
/// Table names are unqualified; implementations resolve them in
/// [`database`](DestinationStore::database).
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Database holding the destination tables.
    fn database(&self) -> &str;

    /// Execute an arbitrary statement.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Check whether a table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// `MAX(column)` rendered as a SQL literal, `None` when the table is empty.
    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>>;

    /// Create a table with the given columns and storage-engine clause.
    async fn create_table(&self, table: &str, columns: &[ColumnMapping], engine: &str) -> Result<()>;

    /// Atomically swap the identities of two tables.
    async fn exchange_tables(&self, a: &str, b: &str) -> Result<()>;

    /// Rename a table.
    async fn rename_table(&self, from: &str, to: &str) -> Result<()>;

    /// Drop a table if it exists.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Make the source readable from this store, returning the linked database name.
    async fn ensure_source_link(&self, link: &SourceLink) -> Result<String>;

    /// Run `INSERT INTO table <select>` and report progress until it
    /// completes or the callback returns [`ProgressControl::Stop`].
    ///
    /// Rows already inserted when a stop is honored stay in the table.
    async fn stream_insert_select(
        &self,
        table: &str,
        select: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<StreamResult>;

    /// Storage statistics, `None` when the table does not exist.
    async fn table_stats(&self, table: &str) -> Result<Option<TableStats>>;
}

//! In-memory stores for unit tests.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::schema::{ColumnDescriptor, ColumnMapping, SourceLink, TableStats};
use crate::core::traits::{
    DestinationStore, ProgressCallback, ProgressControl, SourceStore, StreamResult,
    TransferProgress,
};
use crate::error::{Result, SyncError};
use crate::migration::{LedgerEntry, LedgerStore};

/// Shared state behind [`FakeSource`] and [`FakeDestination`].
///
/// Rows are modelled by their primary key only.
#[derive(Default)]
pub struct World {
    pub source_rows: Vec<u64>,
    pub columns: Vec<ColumnDescriptor>,
    /// View name to its select text.
    pub views: HashMap<String, String>,
    pub tables: HashMap<String, Vec<u64>>,
    /// Row count of `watch` after every destination mutation.
    pub observed: Vec<Option<usize>>,
    pub watch: Option<String>,
    pub executed: Vec<String>,
    pub links: Vec<String>,
    /// Fail the stream after this many rows.
    pub fail_stream_after: Option<u64>,
    pub fail_describe: bool,
    pub fail_stats: bool,
}

impl World {
    fn observe(&mut self) {
        if let Some(ref watch) = self.watch {
            let count = self.tables.get(watch).map(Vec::len);
            self.observed.push(count);
        }
    }
}

pub type SharedWorld = Arc<Mutex<World>>;

pub fn world(source_rows: &[u64]) -> SharedWorld {
    Arc::new(Mutex::new(World {
        source_rows: source_rows.to_vec(),
        columns: vec![
            ColumnDescriptor {
                name: "id".into(),
                native_type: "bigint(20) unsigned".into(),
                nullable: false,
            },
            ColumnDescriptor {
                name: "amount".into(),
                native_type: "decimal(10,2)".into(),
                nullable: true,
            },
        ],
        ..Default::default()
    }))
}

pub fn link() -> SourceLink {
    SourceLink {
        host: "mysql".into(),
        port: 3306,
        database: "shop".into(),
        user: "sync".into(),
        password: "pw".into(),
    }
}

pub struct FakeSource {
    pub world: SharedWorld,
    pub link: SourceLink,
}

impl FakeSource {
    pub fn new(world: &SharedWorld) -> Self {
        Self {
            world: Arc::clone(world),
            link: link(),
        }
    }
}

#[async_trait]
impl SourceStore for FakeSource {
    fn link(&self) -> &SourceLink {
        &self.link
    }

    async fn describe_query(&mut self, _query: &str) -> Result<Vec<ColumnDescriptor>> {
        let world = self.world.lock().unwrap();
        if world.fail_describe {
            return Err(SyncError::destination("You have an error in your SQL syntax"));
        }
        Ok(world.columns.clone())
    }

    async fn create_view(&mut self, view: &str, select: &str) -> Result<()> {
        self.world
            .lock()
            .unwrap()
            .views
            .insert(view.to_string(), select.to_string());
        Ok(())
    }

    async fn drop_view(&mut self, view: &str) -> Result<()> {
        self.world.lock().unwrap().views.remove(view);
        Ok(())
    }
}

pub struct FakeDestination {
    pub world: SharedWorld,
    pub database: String,
}

impl FakeDestination {
    pub fn new(world: &SharedWorld) -> Self {
        Self {
            world: Arc::clone(world),
            database: "analytics".into(),
        }
    }
}

/// Lower bound of a trailing `> N` predicate in a view's select.
fn lower_bound(select: &str) -> Option<u64> {
    let re = Regex::new(r">\s*(\d+)\s*$").ok()?;
    re.captures(select)?.get(1)?.as_str().parse().ok()
}

#[async_trait]
impl DestinationStore for FakeDestination {
    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.world.lock().unwrap().executed.push(sql.to_string());
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.world.lock().unwrap().tables.contains_key(table))
    }

    async fn max_value(&self, table: &str, _column: &str) -> Result<Option<String>> {
        let world = self.world.lock().unwrap();
        let rows = world
            .tables
            .get(table)
            .ok_or_else(|| SyncError::destination(format!("no table {}", table)))?;
        Ok(rows.iter().max().map(|v| v.to_string()))
    }

    async fn create_table(&self, table: &str, columns: &[ColumnMapping], engine: &str) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        if world.tables.contains_key(table) {
            return Err(SyncError::destination(format!("table {} exists", table)));
        }
        world.executed.push(format!(
            "CREATE {} ({}) {}",
            table,
            columns
                .iter()
                .map(|c| format!("{} {}", c.name, c.data_type))
                .collect::<Vec<_>>()
                .join(", "),
            engine
        ));
        world.tables.insert(table.to_string(), Vec::new());
        world.observe();
        Ok(())
    }

    async fn exchange_tables(&self, a: &str, b: &str) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        let left = world
            .tables
            .remove(a)
            .ok_or_else(|| SyncError::destination(format!("no table {}", a)))?;
        let right = world
            .tables
            .remove(b)
            .ok_or_else(|| SyncError::destination(format!("no table {}", b)))?;
        world.tables.insert(a.to_string(), right);
        world.tables.insert(b.to_string(), left);
        world.observe();
        Ok(())
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        let rows = world
            .tables
            .remove(from)
            .ok_or_else(|| SyncError::destination(format!("no table {}", from)))?;
        world.tables.insert(to.to_string(), rows);
        world.observe();
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut world = self.world.lock().unwrap();
        world.tables.remove(table);
        world.observe();
        Ok(())
    }

    async fn ensure_source_link(&self, link: &SourceLink) -> Result<String> {
        let name = link.linked_database();
        self.world.lock().unwrap().links.push(name.clone());
        Ok(name)
    }

    async fn stream_insert_select(
        &self,
        table: &str,
        select: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<StreamResult> {
        let mut world = self.world.lock().unwrap();

        let view_select = world
            .views
            .iter()
            .find(|(name, _)| select.contains(&format!("`{}`", name)))
            .map(|(_, s)| s.clone())
            .ok_or_else(|| SyncError::destination("extraction view does not exist"))?;
        let bound = lower_bound(&view_select);
        let rows: Vec<u64> = world
            .source_rows
            .iter()
            .copied()
            .filter(|id| bound.map_or(true, |b| *id > b))
            .collect();

        if !world.tables.contains_key(table) {
            return Err(SyncError::destination(format!("no table {}", table)));
        }

        let mut progress = TransferProgress::default();
        for (i, id) in rows.iter().enumerate() {
            if world.fail_stream_after == Some(i as u64) {
                return Err(SyncError::destination("connection reset during insert"));
            }
            if let Some(t) = world.tables.get_mut(table) {
                t.push(*id);
            }
            world.observe();

            progress.read_rows = i as u64 + 1;
            if on_progress(&progress) == ProgressControl::Stop {
                return Ok(StreamResult {
                    rows: progress.read_rows,
                    stopped: true,
                });
            }
        }

        Ok(StreamResult {
            rows: progress.read_rows,
            stopped: false,
        })
    }

    async fn table_stats(&self, table: &str) -> Result<Option<TableStats>> {
        let world = self.world.lock().unwrap();
        if world.fail_stats {
            return Err(SyncError::destination("system.parts unavailable"));
        }
        Ok(world.tables.get(table).map(|rows| TableStats {
            rows: rows.len() as u64,
            engine: Some("MergeTree".into()),
            ..Default::default()
        }))
    }
}

/// Ledger kept in memory.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
    executed: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    ensured: AtomicBool,
}

impl MemoryLedger {
    pub fn push(&self, entry: LedgerEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// Fail any DDL containing `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        *self.fail_on.lock().unwrap() = Some(pattern.to_string());
    }

    pub fn ensured(&self) -> bool {
        self.ensured.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn ensure_ledger(&self) -> Result<()> {
        self.ensured.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn latest_entry(&self, alias: &str, version: &str) -> Result<Option<LedgerEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.alias == alias && e.version == version)
            .max_by_key(|e| (e.timestamp, e.status))
            .cloned())
    }

    async fn append_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.push(entry.clone());
        Ok(())
    }

    async fn apply_ddl(&self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());
        match self.fail_on.lock().unwrap().as_deref() {
            Some(pattern) if sql.contains(pattern) => Err(SyncError::Destination {
                code: Some(62),
                message: "Syntax error".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Destination that also keeps a ledger, for orchestrator tests.
pub struct FakeWarehouse {
    pub destination: FakeDestination,
    pub ledger: Arc<MemoryLedger>,
}

#[async_trait]
impl DestinationStore for FakeWarehouse {
    fn database(&self) -> &str {
        self.destination.database()
    }
    async fn execute(&self, sql: &str) -> Result<()> {
        self.destination.execute(sql).await
    }
    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.destination.table_exists(table).await
    }
    async fn max_value(&self, table: &str, column: &str) -> Result<Option<String>> {
        self.destination.max_value(table, column).await
    }
    async fn create_table(&self, table: &str, columns: &[ColumnMapping], engine: &str) -> Result<()> {
        self.destination.create_table(table, columns, engine).await
    }
    async fn exchange_tables(&self, a: &str, b: &str) -> Result<()> {
        self.destination.exchange_tables(a, b).await
    }
    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.destination.rename_table(from, to).await
    }
    async fn drop_table(&self, table: &str) -> Result<()> {
        self.destination.drop_table(table).await
    }
    async fn ensure_source_link(&self, link: &SourceLink) -> Result<String> {
        self.destination.ensure_source_link(link).await
    }
    async fn stream_insert_select(
        &self,
        table: &str,
        select: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<StreamResult> {
        self.destination
            .stream_insert_select(table, select, on_progress)
            .await
    }
    async fn table_stats(&self, table: &str) -> Result<Option<TableStats>> {
        self.destination.table_stats(table).await
    }
}

#[async_trait]
impl LedgerStore for FakeWarehouse {
    async fn ensure_ledger(&self) -> Result<()> {
        self.ledger.ensure_ledger().await
    }
    async fn latest_entry(&self, alias: &str, version: &str) -> Result<Option<LedgerEntry>> {
        self.ledger.latest_entry(alias, version).await
    }
    async fn append_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.ledger.append_entry(entry).await
    }
    async fn apply_ddl(&self, sql: &str) -> Result<()> {
        self.ledger.apply_ddl(sql).await
    }
}

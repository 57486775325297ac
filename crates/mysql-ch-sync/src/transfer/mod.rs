//! Single-alias transfer engine.
//!
//! One [`TransferEngine::run`] moves the rows of one alias from MySQL into
//! ClickHouse:
//!
//! 1. **Mode selection**: incremental when the destination table exists, a
//!    range clause is configured and the table has a maximum key; full
//!    refresh otherwise.
//! 2. **Schema** (full refresh only): the extraction query is described and
//!    translated into a staging table `tmp_<alias>_<millis>`.
//! 3. **Extraction view**: `tmp_sync_<alias>` on the source, over the query
//!    plus the rendered range predicate.
//! 4. **Streaming**: `INSERT INTO <target> SELECT * FROM mysql_<db>.<view>`,
//!    reporting progress to the caller's callback.
//! 5. **Cleanup**: the view is dropped on every exit path.
//! 6. **Publish** (full refresh only): the staging table is exchanged with
//!    (or renamed to) the alias table, so readers always see a complete table.
//!
//! Engines hold no shared state; distinct aliases can run concurrently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{TransferSpec, MAX_PRIMARY_KEY_PLACEHOLDER};
use crate::core::identifier::qualify;
use crate::core::schema::TableStats;
use crate::core::traits::{DestinationStore, ProgressCallback, SourceStore, StreamResult};
use crate::drivers::{ClickHouseClient, MysqlSource};
use crate::error::{Result, SyncError};
use crate::typemap::SchemaTranslator;

/// How a run filled the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    FullRefresh,
    Incremental,
}

/// Result of one [`TransferEngine::run`].
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub alias: String,
    pub mode: TransferMode,
    /// Incremental predicate appended to the extraction query.
    pub predicate: Option<String>,
    /// Rows transferred in this run.
    pub rows: u64,
    /// True when the progress callback stopped the transfer early.
    pub stopped: bool,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Destination statistics after the run, if they could be fetched.
    pub stats: Option<TableStats>,
}

impl TransferOutcome {
    pub fn rows_per_second(&self) -> u64 {
        if self.duration_seconds > 0.0 {
            (self.rows as f64 / self.duration_seconds) as u64
        } else {
            0
        }
    }
}

enum Plan {
    FullRefresh { replace: bool },
    Incremental { predicate: String },
}

/// Substitute the current maximum key into a range clause template.
pub fn render_range_clause(template: &str, max_primary_key: &str) -> String {
    template.replacen(MAX_PRIMARY_KEY_PLACEHOLDER, max_primary_key, 1)
}

/// Name of the extraction view for an alias.
pub fn extraction_view_name(alias: &str) -> String {
    format!("tmp_sync_{}", alias)
}

fn staging_table_name(alias: &str) -> String {
    format!("tmp_{}_{}", alias, Utc::now().timestamp_millis())
}

/// Runs the transfer for one alias.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    spec: TransferSpec,
}

impl TransferEngine {
    pub fn new(spec: TransferSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &TransferSpec {
        &self.spec
    }

    /// Connect to both stores, transfer, and release the connections.
    pub async fn run(&self, on_progress: ProgressCallback<'_>) -> Result<TransferOutcome> {
        let link = self.spec.source.mysql.link()?;
        let destination = ClickHouseClient::connect(&self.spec.target.clickhouse).await?;
        let mut source = MysqlSource::connect(link).await?;

        let outcome = self.run_with(&mut source, &destination, on_progress).await;

        if let Err(e) = source.close().await {
            warn!("Failed to close MySQL connection for {}: {}", self.spec.alias, e);
        }
        outcome
    }

    /// Transfer using already connected stores.
    pub async fn run_with<S, D>(
        &self,
        source: &mut S,
        destination: &D,
        on_progress: ProgressCallback<'_>,
    ) -> Result<TransferOutcome>
    where
        S: SourceStore + ?Sized,
        D: DestinationStore + ?Sized,
    {
        let alias = self.spec.alias.as_str();
        let started_at = Utc::now();
        let clock = Instant::now();

        let plan = self.select_mode(destination).await?;
        let linked_db = destination.ensure_source_link(source.link()).await?;

        let (target, staging, select) = match plan {
            Plan::FullRefresh { .. } => {
                let staging = staging_table_name(alias);
                self.prepare_staging(source, destination, &staging).await?;
                (staging.clone(), Some(staging), self.spec.source.query.clone())
            }
            Plan::Incremental { ref predicate } => (
                alias.to_string(),
                None,
                format!("{} {}", self.spec.source.query, predicate),
            ),
        };

        let streamed = self
            .stream(source, destination, &linked_db, &target, &select, on_progress)
            .await;

        let result = match (staging, streamed) {
            (Some(staging), Ok(result)) => {
                let replace = matches!(plan, Plan::FullRefresh { replace: true });
                self.publish(destination, &staging, replace).await?;
                result
            }
            (Some(staging), Err(e)) => {
                if let Err(drop_err) = destination.drop_table(&staging).await {
                    warn!("Failed to drop staging table {}: {}", staging, drop_err);
                }
                return Err(e);
            }
            (None, streamed) => streamed?,
        };

        let stats = match destination.table_stats(alias).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Could not fetch statistics for {}: {}", alias, e);
                None
            }
        };

        let (mode, predicate) = match plan {
            Plan::FullRefresh { .. } => (TransferMode::FullRefresh, None),
            Plan::Incremental { predicate } => (TransferMode::Incremental, Some(predicate)),
        };

        Ok(TransferOutcome {
            alias: alias.to_string(),
            mode,
            predicate,
            rows: result.rows,
            stopped: result.stopped,
            started_at,
            duration_seconds: clock.elapsed().as_secs_f64(),
            stats,
        })
    }

    /// Destination statistics for this alias; `None` when the table does not exist.
    pub async fn get_stats(&self) -> Result<Option<TableStats>> {
        let destination = ClickHouseClient::connect(&self.spec.target.clickhouse).await?;
        destination.table_stats(&self.spec.alias).await
    }

    async fn select_mode<D>(&self, destination: &D) -> Result<Plan>
    where
        D: DestinationStore + ?Sized,
    {
        let alias = self.spec.alias.as_str();
        let exists = destination.table_exists(alias).await?;

        if let (true, Some(template), Some(pk)) = (
            exists,
            self.spec.source.range_clause.as_deref(),
            self.spec.target.primary_key.as_deref(),
        ) {
            match destination.max_value(alias, pk).await? {
                Some(max) => {
                    let predicate = render_range_clause(template, &max);
                    info!("{}: incremental transfer with {}", alias, predicate);
                    return Ok(Plan::Incremental { predicate });
                }
                None => info!("{}: destination table is empty, running a full refresh", alias),
            }
        } else {
            info!("{}: full refresh", alias);
        }

        Ok(Plan::FullRefresh { replace: exists })
    }

    async fn prepare_staging<S, D>(&self, source: &mut S, destination: &D, staging: &str) -> Result<()>
    where
        S: SourceStore + ?Sized,
        D: DestinationStore + ?Sized,
    {
        let alias = self.spec.alias.as_str();
        let columns = source
            .describe_query(&self.spec.source.query)
            .await
            .map_err(|e| SyncError::SchemaIntrospection {
                alias: alias.to_string(),
                message: e.to_string(),
            })?;
        if columns.is_empty() {
            return Err(SyncError::SchemaIntrospection {
                alias: alias.to_string(),
                message: "extraction query returned no columns".into(),
            });
        }

        let mappings = columns
            .iter()
            .map(SchemaTranslator::map_column)
            .collect::<Result<Vec<_>>>()?;
        for (column, mapping) in columns.iter().zip(&mappings) {
            debug!("{}: {} {} -> {}", alias, column.name, column.native_type, mapping.data_type);
        }

        destination
            .create_table(staging, &mappings, &self.spec.target.engine_definition)
            .await
    }

    async fn stream<S, D>(
        &self,
        source: &mut S,
        destination: &D,
        linked_db: &str,
        target: &str,
        select: &str,
        on_progress: ProgressCallback<'_>,
    ) -> Result<StreamResult>
    where
        S: SourceStore + ?Sized,
        D: DestinationStore + ?Sized,
    {
        let alias = self.spec.alias.as_str();
        let view = extraction_view_name(alias);

        let streamed = async {
            source.create_view(&view, select).await?;
            let from = qualify(linked_db, &view)?;
            destination
                .stream_insert_select(target, &format!("SELECT * FROM {}", from), on_progress)
                .await
        }
        .await;

        if let Err(e) = source.drop_view(&view).await {
            warn!("Failed to drop extraction view {} for {}: {}", view, alias, e);
        }

        streamed.map_err(|e| match e {
            SyncError::Destination { .. } | SyncError::Http(_) | SyncError::Source(_) => {
                SyncError::transfer(alias, e)
            }
            other => other,
        })
    }

    async fn publish<D>(&self, destination: &D, staging: &str, replace: bool) -> Result<()>
    where
        D: DestinationStore + ?Sized,
    {
        let alias = self.spec.alias.as_str();
        if replace {
            if let Err(e) = destination.exchange_tables(staging, alias).await {
                if let Err(drop_err) = destination.drop_table(staging).await {
                    warn!("Failed to drop staging table {}: {}", staging, drop_err);
                }
                return Err(e);
            }
            // the staging name now holds the previous contents
            if let Err(e) = destination.drop_table(staging).await {
                warn!("Failed to drop replaced table {}: {}", staging, e);
            }
        } else {
            if let Err(e) = destination.rename_table(staging, alias).await {
                if let Err(drop_err) = destination.drop_table(staging).await {
                    warn!("Failed to drop staging table {}: {}", staging, drop_err);
                }
                return Err(e);
            }
        }
        debug!("{}: published {}", alias, staging);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClickHouseConfig, MysqlConfig, SourceConfig, TargetConfig};
    use crate::core::traits::{ProgressControl, TransferProgress};
    use crate::testing::{world, FakeDestination, FakeSource, SharedWorld};

    fn spec(range_clause: Option<&str>) -> TransferSpec {
        TransferSpec {
            alias: "orders".into(),
            schedule: None,
            source: SourceConfig {
                mysql: MysqlConfig {
                    url: "mysql://sync:pw@mysql:3306/shop".into(),
                    username: None,
                    password: None,
                },
                query: "SELECT id, amount FROM orders".into(),
                range_clause: range_clause.map(str::to_string),
            },
            target: TargetConfig {
                clickhouse: ClickHouseConfig {
                    url: "http://clickhouse:8123".into(),
                    db: "analytics".into(),
                    username: None,
                    password: None,
                    progress_interval_ms: 1000,
                    request_timeout_secs: 300,
                },
                primary_key: Some("id".into()),
                engine_definition: "ENGINE = MergeTree ORDER BY id".into(),
            },
        }
    }

    async fn run(engine: &TransferEngine, w: &SharedWorld) -> Result<TransferOutcome> {
        let mut source = FakeSource::new(w);
        let destination = FakeDestination::new(w);
        let mut keep_going = |_: &TransferProgress| ProgressControl::Continue;
        engine.run_with(&mut source, &destination, &mut keep_going).await
    }

    #[test]
    fn test_render_range_clause() {
        assert_eq!(
            render_range_clause("primary_key > ${max_primary_key}", "100"),
            "primary_key > 100"
        );
        assert_eq!(extraction_view_name("orders"), "tmp_sync_orders");
    }

    #[tokio::test]
    async fn test_full_refresh_into_new_table() {
        let w = world(&[1, 2, 3]);
        let engine = TransferEngine::new(spec(None));

        let outcome = run(&engine, &w).await.unwrap();

        assert_eq!(outcome.rows, 3);
        assert_eq!(outcome.mode, TransferMode::FullRefresh);
        assert!(!outcome.stopped);
        assert_eq!(outcome.stats.as_ref().map(|s| s.rows), Some(3));

        let world = w.lock().unwrap();
        assert_eq!(world.tables.len(), 1);
        assert_eq!(world.tables["orders"], vec![1, 2, 3]);
        assert_eq!(world.links, vec!["mysql_shop"]);
        assert!(world.views.is_empty());
        assert!(world.executed[0].contains("id UInt64, amount Nullable(Decimal(10,2))"));
        assert!(world.executed[0].ends_with("ENGINE = MergeTree ORDER BY id"));
    }

    #[tokio::test]
    async fn test_get_stats_after_full_refresh() {
        let w = world(&[1, 2, 3]);
        let engine = TransferEngine::new(spec(None));
        run(&engine, &w).await.unwrap();

        let destination = FakeDestination::new(&w);
        let stats = destination.table_stats("orders").await.unwrap().unwrap();
        assert_eq!(stats.rows, 3);
        assert!(destination.table_stats("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incremental_uses_exact_predicate() {
        let w = world(&[99, 100, 101, 102]);
        w.lock().unwrap().tables.insert("orders".into(), (1..=100).collect());
        let engine = TransferEngine::new(spec(Some("WHERE id > ${max_primary_key}")));

        let outcome = run(&engine, &w).await.unwrap();

        assert_eq!(outcome.mode, TransferMode::Incremental);
        assert_eq!(outcome.predicate.as_deref(), Some("WHERE id > 100"));
        assert_eq!(outcome.rows, 2);
        let world = w.lock().unwrap();
        assert_eq!(world.tables["orders"].len(), 102);
        // no staging table, no DDL
        assert_eq!(world.tables.len(), 1);
        assert!(world.executed.is_empty());
        assert!(world.views.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_on_empty_table_falls_back_to_full_refresh() {
        let w = world(&[1, 2]);
        w.lock().unwrap().tables.insert("orders".into(), Vec::new());
        let engine = TransferEngine::new(spec(Some("WHERE id > ${max_primary_key}")));

        let outcome = run(&engine, &w).await.unwrap();
        assert_eq!(outcome.mode, TransferMode::FullRefresh);
        assert_eq!(outcome.rows, 2);
        assert_eq!(w.lock().unwrap().tables["orders"], vec![1, 2]);
    }

    #[tokio::test]
    async fn test_full_refresh_swap_never_exposes_empty_table() {
        let w = world(&[10, 11, 12]);
        {
            let mut world = w.lock().unwrap();
            world.tables.insert("orders".into(), vec![1, 2, 3, 4, 5]);
            world.watch = Some("orders".into());
        }
        let engine = TransferEngine::new(spec(None));

        let outcome = run(&engine, &w).await.unwrap();
        assert_eq!(outcome.rows, 3);

        let world = w.lock().unwrap();
        assert!(!world.observed.is_empty());
        assert!(
            world.observed.iter().all(|c| matches!(c, Some(n) if *n > 0)),
            "observed {:?}",
            world.observed
        );
        assert_eq!(world.tables["orders"], vec![10, 11, 12]);
        // the replaced table is gone
        assert_eq!(world.tables.len(), 1);
    }

    #[tokio::test]
    async fn test_view_dropped_when_stream_fails() {
        let w = world(&[1, 2, 3]);
        w.lock().unwrap().fail_stream_after = Some(1);
        let engine = TransferEngine::new(spec(None));

        let err = run(&engine, &w).await.unwrap_err();
        assert!(matches!(err, SyncError::Transfer { ref alias, .. } if alias == "orders"));

        let world = w.lock().unwrap();
        assert!(world.views.is_empty());
        // staging dropped, nothing published
        assert!(world.tables.is_empty());
    }

    #[tokio::test]
    async fn test_failed_full_refresh_keeps_existing_table() {
        let w = world(&[7, 8, 9]);
        {
            let mut world = w.lock().unwrap();
            world.tables.insert("orders".into(), vec![1, 2]);
            world.fail_stream_after = Some(2);
        }
        let engine = TransferEngine::new(spec(None));

        assert!(run(&engine, &w).await.is_err());
        let world = w.lock().unwrap();
        assert_eq!(world.tables.len(), 1);
        assert_eq!(world.tables["orders"], vec![1, 2]);
        assert!(world.views.is_empty());
    }

    #[tokio::test]
    async fn test_describe_failure_is_introspection_error() {
        let w = world(&[1]);
        w.lock().unwrap().fail_describe = true;
        let engine = TransferEngine::new(spec(None));

        let err = run(&engine, &w).await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaIntrospection { .. }));
        assert!(!err.is_retryable());
        let world = w.lock().unwrap();
        assert!(world.views.is_empty());
        assert!(world.tables.is_empty());
    }

    #[tokio::test]
    async fn test_stop_request_keeps_streamed_rows() {
        let w = world(&[1, 2, 3, 4, 5]);
        let engine = TransferEngine::new(spec(None));
        let mut source = FakeSource::new(&w);
        let destination = FakeDestination::new(&w);

        let mut ticks = Vec::new();
        let mut stop_after_two = |p: &TransferProgress| {
            ticks.push(p.read_rows);
            if p.read_rows >= 2 {
                ProgressControl::Stop
            } else {
                ProgressControl::Continue
            }
        };
        let outcome = engine
            .run_with(&mut source, &destination, &mut stop_after_two)
            .await
            .unwrap();

        assert!(outcome.stopped);
        assert_eq!(outcome.rows, 2);
        assert_eq!(ticks, vec![1, 2]);
        let world = w.lock().unwrap();
        assert_eq!(world.tables["orders"], vec![1, 2]);
        assert!(world.views.is_empty());
    }

    #[tokio::test]
    async fn test_stats_failure_does_not_fail_run() {
        let w = world(&[1, 2]);
        w.lock().unwrap().fail_stats = true;
        let engine = TransferEngine::new(spec(None));

        let outcome = run(&engine, &w).await.unwrap();
        assert_eq!(outcome.rows, 2);
        assert!(outcome.stats.is_none());
    }

    #[test]
    fn test_rows_per_second() {
        let outcome = TransferOutcome {
            alias: "orders".into(),
            mode: TransferMode::FullRefresh,
            predicate: None,
            rows: 500,
            stopped: false,
            started_at: Utc::now(),
            duration_seconds: 2.0,
            stats: None,
        };
        assert_eq!(outcome.rows_per_second(), 250);
    }
}

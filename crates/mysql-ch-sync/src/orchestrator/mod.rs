//! Runner and scheduler over many aliases.
//!
//! A one-off run walks every alias in order through before-migrations,
//! transfer and after-migrations. Service mode keeps re-running the transfer
//! of every scheduled alias with a fixed delay between runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{AliasConfig, Lifecycle, TransferSpec};
use crate::core::schema::TableStats;
use crate::core::traits::{DestinationStore, ProgressControl, SourceStore, TransferProgress};
use crate::drivers::{ClickHouseClient, MysqlSource};
use crate::error::{Result, SyncError};
use crate::migration::{LedgerStore, MigrationManager, MigrationReport};
use crate::transfer::{TransferEngine, TransferOutcome};

/// Opens the stores an alias runs against.
#[async_trait]
pub trait StoreConnector: Send + Sync + 'static {
    type Source: SourceStore + 'static;
    /// The destination also hosts the migration ledger.
    type Destination: DestinationStore + LedgerStore + 'static;

    async fn connect_source(&self, spec: &TransferSpec) -> Result<Self::Source>;

    async fn connect_destination(&self, spec: &TransferSpec) -> Result<Self::Destination>;

    /// Release a source connection once the transfer is over.
    async fn release_source(&self, source: Self::Source) -> Result<()> {
        drop(source);
        Ok(())
    }
}

/// Connects to the MySQL and ClickHouse servers named in each spec.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveConnector;

#[async_trait]
impl StoreConnector for LiveConnector {
    type Source = MysqlSource;
    type Destination = ClickHouseClient;

    async fn connect_source(&self, spec: &TransferSpec) -> Result<MysqlSource> {
        MysqlSource::connect(spec.source.mysql.link()?).await
    }

    async fn connect_destination(&self, spec: &TransferSpec) -> Result<ClickHouseClient> {
        ClickHouseClient::connect(&spec.target.clickhouse).await
    }

    async fn release_source(&self, source: MysqlSource) -> Result<()> {
        source.close().await
    }
}

/// How an alias's last run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Success,
    Stopped,
    Failed,
}

/// Outcome of one alias within a run.
#[derive(Debug, Clone, Serialize)]
pub struct AliasReport {
    pub alias: String,
    pub state: RunState,
    /// Rows transferred, or streamed before the failure.
    pub rows: u64,
    pub before: MigrationReport,
    pub after: MigrationReport,
    pub transfer: Option<TransferOutcome>,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

impl AliasReport {
    fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            state: RunState::Running,
            rows: 0,
            before: MigrationReport::default(),
            after: MigrationReport::default(),
            transfer: None,
            error: None,
            duration_seconds: 0.0,
        }
    }

    fn fail(&mut self, err: &SyncError) {
        error!("{}: {}", self.alias, err.format_detailed());
        self.state = RunState::Failed;
        self.error = Some(err.to_string());
    }
}

/// Last known state of an alias, kept across service-mode runs.
#[derive(Debug, Clone, Serialize)]
pub struct AliasStatus {
    pub alias: String,
    pub state: RunState,
    pub runs: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_rows: u64,
    pub last_success: Option<TransferOutcome>,
    pub last_error: Option<String>,
}

impl AliasStatus {
    fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            state: RunState::Idle,
            runs: 0,
            last_started_at: None,
            last_finished_at: None,
            last_rows: 0,
            last_success: None,
            last_error: None,
        }
    }
}

/// Destination statistics of one alias.
#[derive(Debug, Clone, Serialize)]
pub struct AliasStats {
    pub alias: String,
    pub stats: Option<TableStats>,
    pub error: Option<String>,
}

/// Result of [`Orchestrator::run_once`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique run identifier.
    pub run_id: String,

    /// `completed`, `failed` or `cancelled`.
    pub status: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub aliases_total: usize,
    pub aliases_success: usize,
    pub aliases_failed: usize,

    pub rows_transferred: u64,

    /// Average throughput (rows/second).
    pub rows_per_second: u64,

    pub failed_aliases: Vec<String>,
    pub reports: Vec<AliasReport>,
}

impl RunSummary {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn has_failures(&self) -> bool {
        self.aliases_failed > 0
    }
}

/// Decide whether a transfer keeps going, logging its progress.
pub fn progress_control(
    alias: &str,
    progress: &TransferProgress,
    cancel: &CancellationToken,
) -> ProgressControl {
    if progress.total_rows_approx > 0 {
        info!(
            "{}: {}/{} rows ({:.1}%), {} bytes in {:.1}s",
            alias,
            progress.read_rows,
            progress.total_rows_approx,
            progress.read_rows as f64 * 100.0 / progress.total_rows_approx as f64,
            progress.read_bytes,
            progress.elapsed.as_secs_f64()
        );
    } else {
        info!(
            "{}: {} rows, {} bytes in {:.1}s",
            alias,
            progress.read_rows,
            progress.read_bytes,
            progress.elapsed.as_secs_f64()
        );
    }

    if cancel.is_cancelled() {
        ProgressControl::Stop
    } else {
        ProgressControl::Continue
    }
}

/// Runs migrations and transfers for a set of aliases.
pub struct Orchestrator<C: StoreConnector = LiveConnector> {
    aliases: Vec<AliasConfig>,
    connector: C,
    pool_size: usize,
    statuses: RwLock<HashMap<String, AliasStatus>>,
}

impl Orchestrator<LiveConnector> {
    /// Create an orchestrator connecting to the servers in each alias's spec.
    pub fn new(aliases: Vec<AliasConfig>) -> Self {
        Self::with_connector(aliases, LiveConnector)
    }
}

impl<C: StoreConnector> Orchestrator<C> {
    pub fn with_connector(aliases: Vec<AliasConfig>, connector: C) -> Self {
        let statuses = aliases
            .iter()
            .map(|a| (a.spec.alias.clone(), AliasStatus::new(&a.spec.alias)))
            .collect();
        Self {
            aliases,
            connector,
            pool_size: 4,
            statuses: RwLock::new(statuses),
        }
    }

    /// Maximum number of concurrent transfers in service mode.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn aliases(&self) -> &[AliasConfig] {
        &self.aliases
    }

    /// Process every alias once, in order.
    ///
    /// A failing alias is reported and the next one proceeds. Once `cancel`
    /// fires, in-flight transfers stop at their next progress tick and the
    /// remaining aliases are not started.
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!("Starting run {} over {} aliases", run_id, self.aliases.len());

        let mut reports = Vec::with_capacity(self.aliases.len());
        for alias in &self.aliases {
            if cancel.is_cancelled() {
                info!("Cancellation requested, not starting {}", alias.spec.alias);
                break;
            }
            reports.push(self.process_alias(alias, cancel, true).await);
        }

        let duration_seconds = clock.elapsed().as_secs_f64();
        let rows_transferred: u64 = reports.iter().map(|r| r.rows).sum();
        let failed_aliases: Vec<String> = reports
            .iter()
            .filter(|r| r.state == RunState::Failed)
            .map(|r| r.alias.clone())
            .collect();
        let aliases_success = reports.iter().filter(|r| r.state == RunState::Success).count();

        let status = if cancel.is_cancelled() {
            "cancelled"
        } else if failed_aliases.is_empty() {
            "completed"
        } else {
            "failed"
        };

        RunSummary {
            run_id,
            status: status.to_string(),
            started_at,
            completed_at: Utc::now(),
            duration_seconds,
            aliases_total: self.aliases.len(),
            aliases_success,
            aliases_failed: failed_aliases.len(),
            rows_transferred,
            rows_per_second: if duration_seconds > 0.0 {
                (rows_transferred as f64 / duration_seconds) as u64
            } else {
                0
            },
            failed_aliases,
            reports,
        }
    }

    /// Re-run the transfer of every alias with a schedule until `cancel` fires.
    ///
    /// Each alias waits its interval after a run finishes before starting the
    /// next one. At most `pool_size` transfers run at the same time.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut scheduled = Vec::new();
        for (index, alias) in self.aliases.iter().enumerate() {
            match alias.spec.schedule {
                Some(ref schedule) => scheduled.push((index, schedule.interval()?)),
                None => info!("{} has no schedule, not serving it", alias.spec.alias),
            }
        }
        if scheduled.is_empty() {
            warn!("No alias has a schedule, nothing to serve");
            return Ok(());
        }

        info!(
            "Serving {} aliases with {} transfer slots",
            scheduled.len(),
            self.pool_size
        );

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut tasks = JoinSet::new();
        for (index, interval) in scheduled {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move { this.schedule_loop(index, interval, semaphore, cancel).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Service stopped");
        Ok(())
    }

    async fn schedule_loop(
        &self,
        index: usize,
        interval: Duration,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) {
        let alias = &self.aliases[index];
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let report = self.process_alias(alias, &cancel, false).await;
            drop(permit);
            if report.state == RunState::Success {
                info!(
                    "{}: {} rows in {:.1}s, next run in {:?}",
                    report.alias, report.rows, report.duration_seconds, interval
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Snapshot of every alias's status.
    pub async fn statuses(&self) -> Vec<AliasStatus> {
        let statuses = self.statuses.read().await;
        let mut snapshot: Vec<AliasStatus> = statuses.values().cloned().collect();
        snapshot.sort_by(|a, b| a.alias.cmp(&b.alias));
        snapshot
    }

    /// Destination statistics for every alias.
    pub async fn stats(&self) -> Vec<AliasStats> {
        let mut all = Vec::with_capacity(self.aliases.len());
        for alias in &self.aliases {
            let name = alias.spec.alias.clone();
            let fetched = async {
                let destination = self.connector.connect_destination(&alias.spec).await?;
                destination.table_stats(&name).await
            }
            .await;
            all.push(match fetched {
                Ok(stats) => AliasStats { alias: name, stats, error: None },
                Err(e) => {
                    warn!("Could not fetch statistics for {}: {}", name, e);
                    AliasStats { alias: name, stats: None, error: Some(e.to_string()) }
                }
            });
        }
        all
    }

    async fn process_alias(
        &self,
        alias: &AliasConfig,
        cancel: &CancellationToken,
        with_migrations: bool,
    ) -> AliasReport {
        let name = alias.spec.alias.as_str();
        let clock = Instant::now();
        self.mark_started(name).await;

        let mut report = AliasReport::new(name);
        if let Err(e) = self
            .run_alias(alias, cancel, with_migrations, &mut report)
            .await
        {
            report.fail(&e);
        }
        report.duration_seconds = clock.elapsed().as_secs_f64();

        self.mark_finished(&report).await;
        report
    }

    async fn run_alias(
        &self,
        alias: &AliasConfig,
        cancel: &CancellationToken,
        with_migrations: bool,
        report: &mut AliasReport,
    ) -> Result<()> {
        let name = alias.spec.alias.as_str();
        let destination = self.connector.connect_destination(&alias.spec).await?;
        let manager = MigrationManager::new(&destination);

        if with_migrations {
            report.before = manager
                .run(name, &alias.migrations, Lifecycle::Before)
                .await?;
        }

        let mut source = self.connector.connect_source(&alias.spec).await?;
        let engine = TransferEngine::new(alias.spec.clone());
        let mut streamed = 0u64;
        let transferred = {
            let mut on_progress = |p: &TransferProgress| {
                streamed = p.read_rows;
                progress_control(name, p, cancel)
            };
            engine
                .run_with(&mut source, &destination, &mut on_progress)
                .await
        };
        if let Err(e) = self.connector.release_source(source).await {
            warn!("Failed to release source connection for {}: {}", name, e);
        }

        let outcome = match transferred {
            Ok(outcome) => outcome,
            Err(e) => {
                report.rows = streamed;
                return Err(e);
            }
        };
        report.rows = outcome.rows;
        let stopped = outcome.stopped;
        report.transfer = Some(outcome);
        if stopped {
            info!("{}: transfer stopped after {} rows", name, report.rows);
            report.state = RunState::Stopped;
            return Ok(());
        }

        if with_migrations {
            report.after = manager
                .run(name, &alias.migrations, Lifecycle::After)
                .await?;
        }
        report.state = RunState::Success;
        Ok(())
    }

    async fn mark_started(&self, alias: &str) {
        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(alias.to_string())
            .or_insert_with(|| AliasStatus::new(alias));
        status.state = RunState::Running;
        status.runs += 1;
        status.last_started_at = Some(Utc::now());
    }

    async fn mark_finished(&self, report: &AliasReport) {
        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(report.alias.clone())
            .or_insert_with(|| AliasStatus::new(&report.alias));
        status.state = report.state;
        status.last_finished_at = Some(Utc::now());
        status.last_rows = report.rows;
        match report.state {
            RunState::Failed => status.last_error = report.error.clone(),
            _ => {
                if let Some(ref outcome) = report.transfer {
                    status.last_success = Some(outcome.clone());
                }
                status.last_error = None;
            }
        }
    }
}

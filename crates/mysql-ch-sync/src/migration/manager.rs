//! Applies migrations for one alias and lifecycle phase.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::ledger::{LedgerEntry, LedgerStatus, LedgerStore};
use crate::config::{Lifecycle, MigrationRecord};
use crate::error::{Result, SyncError};

/// A successfully applied migration whose text has since changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumDrift {
    pub alias: String,
    pub version: String,
    /// Checksum recorded when the migration was applied.
    pub recorded: String,
    /// Checksum of the current migration text.
    pub current: String,
}

/// Receives checksum drift notifications.
pub type DriftHook = Arc<dyn Fn(&ChecksumDrift) + Send + Sync>;

/// Versions applied and skipped by one [`MigrationManager::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// SHA-256 hex digest of a migration's query text.
pub fn checksum(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}

/// Applies migrations against a [`LedgerStore`].
pub struct MigrationManager<'a> {
    ledger: &'a dyn LedgerStore,
    drift_hook: DriftHook,
}

impl fmt::Debug for MigrationManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManager").finish_non_exhaustive()
    }
}

impl<'a> MigrationManager<'a> {
    pub fn new(ledger: &'a dyn LedgerStore) -> Self {
        Self {
            ledger,
            drift_hook: Arc::new(|drift: &ChecksumDrift| {
                debug!(
                    "Migration {} for {} changed since it was applied ({} -> {})",
                    drift.version, drift.alias, drift.recorded, drift.current
                );
            }),
        }
    }

    /// Replace the checksum drift hook. The migration is still skipped.
    pub fn with_drift_hook(mut self, hook: DriftHook) -> Self {
        self.drift_hook = hook;
        self
    }

    /// Apply the migrations of `phase` for `alias`, in the given order.
    ///
    /// Stops at the first migration whose latest ledger entry is a failure,
    /// and at the first DDL that fails.
    pub async fn run(
        &self,
        alias: &str,
        migrations: &[MigrationRecord],
        phase: Lifecycle,
    ) -> Result<MigrationReport> {
        self.ledger.ensure_ledger().await?;

        let mut report = MigrationReport::default();
        for migration in migrations.iter().filter(|m| m.lifecycle == phase) {
            let sum = checksum(&migration.query);

            match self.ledger.latest_entry(alias, &migration.version).await? {
                Some(entry) if entry.status == LedgerStatus::Success => {
                    if entry.checksum != sum {
                        (self.drift_hook)(&ChecksumDrift {
                            alias: alias.to_string(),
                            version: migration.version.clone(),
                            recorded: entry.checksum,
                            current: sum,
                        });
                    }
                    debug!("Migration {} for {} already applied", migration.version, alias);
                    report.skipped.push(migration.version.clone());
                    continue;
                }
                Some(entry) if entry.status == LedgerStatus::Failure => {
                    return Err(SyncError::LedgerConflict {
                        alias: alias.to_string(),
                        version: migration.version.clone(),
                    });
                }
                Some(_) => {
                    warn!(
                        "Migration {} for {} was started but never finished, applying again",
                        migration.version, alias
                    );
                }
                None => {}
            }

            self.apply(alias, migration, sum).await?;
            report.applied.push(migration.version.clone());
        }

        Ok(report)
    }

    async fn apply(&self, alias: &str, migration: &MigrationRecord, sum: String) -> Result<()> {
        let entry = |status: LedgerStatus, elapsed: Duration| LedgerEntry {
            alias: alias.to_string(),
            version: migration.version.clone(),
            timestamp: Utc::now(),
            lifecycle: migration.lifecycle,
            status,
            elapsed,
            checksum: sum.clone(),
        };

        info!(
            "Applying {} migration {} for {}",
            migration.lifecycle, migration.version, alias
        );
        self.ledger
            .append_entry(&entry(LedgerStatus::Start, Duration::ZERO))
            .await?;

        let started = Instant::now();
        match self.ledger.apply_ddl(&migration.query).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.ledger
                    .append_entry(&entry(LedgerStatus::Success, elapsed))
                    .await?;
                info!(
                    "Migration {} for {} applied in {:.3}s",
                    migration.version,
                    alias,
                    elapsed.as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                if let Err(ledger_err) = self
                    .ledger
                    .append_entry(&entry(LedgerStatus::Failure, started.elapsed()))
                    .await
                {
                    warn!(
                        "Could not record failure of migration {} for {}: {}",
                        migration.version, alias, ledger_err
                    );
                }
                Err(SyncError::Migration {
                    alias: alias.to_string(),
                    version: migration.version.clone(),
                    message: e.to_string(),
                })
            }
        }
    }
}

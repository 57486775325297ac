//! # mysql-ch-sync
//!
//! Incremental MySQL to ClickHouse table synchronization library.
//!
//! Each *alias* pairs one MySQL extraction query with one ClickHouse table:
//!
//! - **Full refresh** builds a staging table from the query's described schema,
//!   streams every row into it and swaps it in atomically
//! - **Incremental append** streams only rows beyond the destination's current
//!   maximum primary key
//! - **Migrations** apply versioned DDL before or after a transfer, recorded in
//!   an append-only ledger table on the destination
//! - **Type mapping** from MySQL column types to ClickHouse types
//!
//! Rows never pass through this process: ClickHouse pulls them from MySQL
//! through a `MySQL` database engine link and an extraction view.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mysql_ch_sync::{ProgressControl, TransferEngine, TransferProgress, TransferSpec};
//!
//! #[tokio::main]
//! async fn main() -> mysql_ch_sync::Result<()> {
//!     let spec = TransferSpec::from_yaml(&std::fs::read_to_string("orders/transfer.yml")?)?;
//!     let engine = TransferEngine::new(spec);
//!     let outcome = engine
//!         .run(&mut |_: &TransferProgress| ProgressControl::Continue)
//!         .await?;
//!     println!("Transferred {} rows", outcome.rows);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod migration;
pub mod orchestrator;
pub mod transfer;
pub mod typemap;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use config::{AliasConfig, Lifecycle, MigrationRecord, TransferSpec};
pub use crate::core::{ProgressControl, TableStats, TransferProgress};
pub use error::{Result, SyncError};
pub use migration::{MigrationManager, MigrationReport};
pub use orchestrator::{AliasReport, AliasStatus, Orchestrator, RunSummary};
pub use transfer::{TransferEngine, TransferMode, TransferOutcome};
pub use typemap::{CanonicalType, SchemaTranslator};

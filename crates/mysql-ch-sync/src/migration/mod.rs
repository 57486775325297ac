//! Versioned schema-evolution DDL, tracked in an append-only ledger.
//!
//! Each alias may carry hand-authored migrations that run either before or
//! after its data transfer. Every attempt is recorded in the ledger; the latest
//! entry for an `(alias, version)` decides whether the migration is pending,
//! already applied, or blocked by an earlier failure.

mod ledger;
mod manager;

pub use ledger::{
    ledger_status_to_str, str_to_ledger_status, LedgerEntry, LedgerStatus, LedgerStore,
    LEDGER_TABLE,
};
pub use manager::{checksum, ChecksumDrift, DriftHook, MigrationManager, MigrationReport};

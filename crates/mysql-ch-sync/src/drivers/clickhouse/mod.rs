//! ClickHouse destination driver.
//!
//! Talks to the HTTP interface with `reqwest`. [`ClickHouseClient`] implements
//! both [`DestinationStore`](crate::core::DestinationStore) and the migration
//! [`LedgerStore`](crate::migration::LedgerStore).

mod client;
mod ledger;
pub mod sql;

pub use client::ClickHouseClient;

//! Core abstractions shared by the engine, the migration manager and the drivers.
//!
//! - [`schema`]: column, link and storage statistic types
//! - [`traits`]: the source and destination store capabilities the engine consumes
//! - [`identifier`]: identifier validation and quoting for generated SQL
//!
//! The engine only talks to [`SourceStore`] and [`DestinationStore`], so it can
//! be exercised against in-memory implementations as well as the real
//! MySQL and ClickHouse drivers.

pub mod identifier;
pub mod schema;
pub mod traits;

pub use schema::{ColumnDescriptor, ColumnMapping, SourceLink, TableStats};
pub use traits::{
    DestinationStore, ProgressCallback, ProgressControl, SourceStore, StreamResult,
    TransferProgress,
};

//! Column, link and storage statistic types.

use crate::typemap::CanonicalType;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A result column of the extraction query, as described by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name.
    pub name: String,
    /// Native source type, e.g. `bigint(20) unsigned`.
    pub native_type: String,
    /// Whether the column allows NULL.
    pub nullable: bool,
}

/// A destination column after type translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub name: String,
    pub data_type: CanonicalType,
}

/// Connection details the destination uses to read the source directly.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceLink {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl SourceLink {
    /// Name of the destination-side database that mirrors the source database.
    pub fn linked_database(&self) -> String {
        format!("mysql_{}", self.database)
    }
}

impl fmt::Debug for SourceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceLink")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Storage statistics of a destination table, summed over its active parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableStats {
    pub rows: u64,
    pub bytes_on_disk: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub last_modified: Option<NaiveDateTime>,
    pub engine: Option<String>,
}

impl TableStats {
    /// Uncompressed to compressed size ratio, 0.0 when nothing is stored.
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            0.0
        } else {
            self.uncompressed_bytes as f64 / self.compressed_bytes as f64
        }
    }
}

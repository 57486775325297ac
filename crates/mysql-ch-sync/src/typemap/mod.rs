//! Type mapping from MySQL column types to ClickHouse.
//!
//! Matching works on the lowercased native type string in a fixed priority
//! order. Anything unrecognized falls through to `String`; the only failure is
//! a `decimal` type without both precision and scale.

use crate::core::schema::{ColumnDescriptor, ColumnMapping};
use crate::error::{Result, SyncError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// ClickHouse scalar type before the unsigned and nullable modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    DateTime,
    Date,
    Decimal { precision: u32, scale: u32 },
    String,
}

/// Destination column type produced by [`SchemaTranslator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalType {
    pub scalar: ScalarType,
    pub unsigned: bool,
    pub nullable: bool,
}

impl CanonicalType {
    fn new(scalar: ScalarType, unsigned: bool) -> Self {
        Self {
            scalar,
            unsigned,
            nullable: false,
        }
    }

    /// Wrap in `Nullable(...)` when `nullable` is set.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

impl ScalarType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64
        )
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Int8 => f.write_str("Int8"),
            ScalarType::Int16 => f.write_str("Int16"),
            ScalarType::Int32 => f.write_str("Int32"),
            ScalarType::Int64 => f.write_str("Int64"),
            ScalarType::Float32 => f.write_str("Float32"),
            ScalarType::Float64 => f.write_str("Float64"),
            ScalarType::DateTime => f.write_str("DateTime"),
            ScalarType::Date => f.write_str("Date"),
            ScalarType::Decimal { precision, scale } => {
                write!(f, "Decimal({},{})", precision, scale)
            }
            ScalarType::String => f.write_str("String"),
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // only the integer types have unsigned variants
        let base = if self.unsigned && self.scalar.is_integer() {
            format!("U{}", self.scalar)
        } else {
            self.scalar.to_string()
        };
        if self.nullable {
            write!(f, "Nullable({})", base)
        } else {
            f.write_str(&base)
        }
    }
}

/// Maps MySQL native column types to ClickHouse types.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaTranslator;

impl SchemaTranslator {
    /// Map a native type string, ignoring nullability.
    pub fn map(native_type: &str) -> Result<CanonicalType> {
        let lower = native_type.to_lowercase();
        let unsigned = lower.contains("unsigned");

        // tinyint/smallint/mediumint stay signed even when declared unsigned
        match base_token(&lower) {
            "tinyint" => return Ok(CanonicalType::new(ScalarType::Int8, false)),
            "smallint" => return Ok(CanonicalType::new(ScalarType::Int16, false)),
            "mediumint" => return Ok(CanonicalType::new(ScalarType::Int32, false)),
            _ => {}
        }

        let mapped = if lower.contains("bigint") {
            CanonicalType::new(ScalarType::Int64, unsigned)
        } else if lower.contains("int") {
            CanonicalType::new(ScalarType::Int32, unsigned)
        } else if lower.contains("float") {
            CanonicalType::new(ScalarType::Float32, unsigned)
        } else if lower.contains("double") {
            CanonicalType::new(ScalarType::Float64, unsigned)
        } else if lower.contains("datetime") || lower.contains("timestamp") {
            CanonicalType::new(ScalarType::DateTime, unsigned)
        } else if lower.contains("decimal") {
            let (precision, scale) = decimal_params(&lower)?;
            CanonicalType::new(ScalarType::Decimal { precision, scale }, false)
        } else if lower.contains("date") {
            CanonicalType::new(ScalarType::Date, unsigned)
        } else if lower.contains("bit") || lower.contains("boolean") {
            CanonicalType::new(ScalarType::Int8, true)
        } else {
            CanonicalType::new(ScalarType::String, false)
        };

        Ok(mapped)
    }

    /// Map a native type string, wrapping in `Nullable` when `nullable`.
    pub fn map_nullable(native_type: &str, nullable: bool) -> Result<CanonicalType> {
        Ok(Self::map(native_type)?.with_nullable(nullable))
    }

    /// Map a described source column to its destination column.
    pub fn map_column(column: &ColumnDescriptor) -> Result<ColumnMapping> {
        Ok(ColumnMapping {
            name: column.name.clone(),
            data_type: Self::map_nullable(&column.native_type, column.nullable)?,
        })
    }
}

/// Leading alphabetic token, e.g. `tinyint` for `tinyint(3) unsigned`.
fn base_token(lower: &str) -> &str {
    let end = lower
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(lower.len());
    &lower[..end]
}

fn decimal_params(lower: &str) -> Result<(u32, u32)> {
    static DIGITS: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let digits = DIGITS
        .get_or_init(|| Regex::new(r"\d+"))
        .as_ref()
        .map_err(|e| SyncError::Translation(e.to_string()))?;

    let mut groups = digits.find_iter(lower).map(|m| m.as_str().parse::<u32>());
    let precision = groups
        .next()
        .and_then(|r| r.ok())
        .ok_or_else(|| SyncError::Translation(format!("missing decimal precision in '{}'", lower)))?;
    let scale = groups
        .next()
        .and_then(|r| r.ok())
        .ok_or_else(|| SyncError::Translation(format!("missing decimal scale in '{}'", lower)))?;
    Ok((precision, scale))
}

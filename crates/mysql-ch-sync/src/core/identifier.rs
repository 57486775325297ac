//! Identifier validation and quoting.
//!
//! Identifiers cannot be bound as parameters, so every table, view and
//! database name that ends up in generated SQL goes through these helpers.
//! MySQL and ClickHouse both accept backtick-quoted identifiers.

use crate::error::{Result, SyncError};

/// Maximum identifier length (MySQL limits view and table names to 64).
const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Validate an identifier.
///
/// Rejects empty names, names containing null bytes and names longer
/// than [`MAX_IDENTIFIER_LENGTH`].
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SyncError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(SyncError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(SyncError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote an identifier with backticks, doubling embedded backticks.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote `database.table`.
pub fn qualify(database: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(database)?, quote_ident(table)?))
}

/// Quote a string literal, escaping backslashes and single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

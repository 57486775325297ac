//! Statement builders and response parsing for the ClickHouse driver.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::sync::OnceLock;

use crate::core::identifier::{qualify, quote_ident, quote_literal};
use crate::core::schema::{ColumnMapping, SourceLink};
use crate::error::{Result, SyncError};
use crate::migration::LEDGER_TABLE;

/// `CREATE TABLE db.table (...) <engine>`.
pub fn create_table_sql(
    database: &str,
    table: &str,
    columns: &[ColumnMapping],
    engine: &str,
) -> Result<String> {
    if columns.is_empty() {
        return Err(SyncError::destination(format!(
            "cannot create {} without columns",
            table
        )));
    }

    let defs = columns
        .iter()
        .map(|c| Ok(format!("{} {}", quote_ident(&c.name)?, c.data_type)))
        .collect::<Result<Vec<_>>>()?;

    Ok(format!(
        "CREATE TABLE {} ({}) {}",
        qualify(database, table)?,
        defs.join(", "),
        engine.trim()
    ))
}

/// `CREATE DATABASE IF NOT EXISTS mysql_<db> ENGINE = MySQL(...)`.
///
/// With `redact` the password is masked, for logging.
pub fn source_link_sql(link: &SourceLink, redact: bool) -> Result<String> {
    let password = if redact { "******" } else { link.password.as_str() };
    Ok(format!(
        "CREATE DATABASE IF NOT EXISTS {} ENGINE = MySQL({}, {}, {}, {})",
        quote_ident(&link.linked_database())?,
        quote_literal(&format!("{}:{}", link.host, link.port)),
        quote_literal(&link.database),
        quote_literal(&link.user),
        quote_literal(password)
    ))
}

/// Ledger table definition.
pub fn create_ledger_sql(database: &str) -> Result<String> {
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (
            alias String,
            version String,
            timestamp DateTime64(3, 'UTC'),
            lifecycle Enum8('before' = 1, 'after' = 2),
            status Enum8('start' = 0, 'success' = 1, 'failure' = 2),
            elapsed_ms UInt64,
            checksum String
        ) ENGINE = MergeTree ORDER BY (alias, version)",
        qualify(database, LEDGER_TABLE)?
    ))
}

/// Extract the error code from a `Code: N. DB::Exception: ...` body.
pub fn parse_exception_code(body: &str) -> Option<u32> {
    static CODE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let code = CODE
        .get_or_init(|| Regex::new(r"^\s*Code:\s*(\d+)"))
        .as_ref()
        .ok()?;
    code.captures(body)?.get(1)?.as_str().parse().ok()
}

/// Render a `toString(max(..))` result as a literal for the range clause.
///
/// Numbers stay bare; dates, strings and anything else are quoted.
pub fn watermark_literal(value: &str) -> String {
    let numeric_chars = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'));
    let numeric = !value.is_empty()
        && numeric_chars
        && (value.parse::<i128>().is_ok() || value.parse::<f64>().map_or(false, f64::is_finite));

    if numeric {
        value.to_string()
    } else {
        quote_literal(value)
    }
}

/// Build a Destination error from a failed response.
pub fn exception(header_code: Option<u32>, body: &str) -> SyncError {
    SyncError::Destination {
        code: header_code.or_else(|| parse_exception_code(body)),
        message: body.trim().to_string(),
    }
}

/// Parse a `toString(DateTime)` value; the epoch means "never".
pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let parsed = NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()?;
    if parsed.and_utc().timestamp() == 0 {
        None
    } else {
        Some(parsed)
    }
}

/// Deserialize a u64 sent either as a JSON number or as a quoted string.
///
/// 64-bit integers arrive quoted unless the server is told otherwise, and the
/// `X-ClickHouse-Summary` header always quotes them.
pub fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
        Null(()),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Null(()) => Ok(0),
    }
}

/// Parse JSONEachRow output.
pub fn parse_rows<T: serde::de::DeserializeOwned>(body: &str) -> Result<Vec<T>> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(SyncError::from))
        .collect()
}

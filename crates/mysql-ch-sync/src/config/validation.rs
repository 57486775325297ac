//! Configuration validation.

use super::{MigrationRecord, TransferSpec, MAX_PRIMARY_KEY_PLACEHOLDER};
use crate::error::{Result, SyncError};
use std::collections::HashSet;

/// Longest alias whose staging table name (`tmp_<alias>_<millis>`) still
/// fits in 64 characters.
const MAX_ALIAS_LENGTH: usize = 45;

/// Validate a transfer spec.
pub fn validate(spec: &TransferSpec) -> Result<()> {
    if spec.alias.is_empty() {
        return Err(SyncError::Config("alias is required".into()));
    }
    if !spec
        .alias
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SyncError::Config(format!(
            "alias must contain only letters, digits and underscores, got '{}'",
            spec.alias
        )));
    }
    if spec.alias.len() > MAX_ALIAS_LENGTH {
        return Err(SyncError::Config(format!(
            "alias must be at most {} characters, got {}",
            MAX_ALIAS_LENGTH,
            spec.alias.len()
        )));
    }

    // Source validation
    spec.source.mysql.link()?;
    if spec.source.query.trim().is_empty() {
        return Err(SyncError::Config("source.query is required".into()));
    }

    // Target validation
    if spec.target.clickhouse.url.is_empty() {
        return Err(SyncError::Config("target.clickhouse.url is required".into()));
    }
    if spec.target.clickhouse.db.is_empty() {
        return Err(SyncError::Config("target.clickhouse.db is required".into()));
    }
    if spec.target.engine_definition.trim().is_empty() {
        return Err(SyncError::Config(
            "target.engine_definition is required".into(),
        ));
    }
    if spec.target.clickhouse.progress_interval_ms == 0 {
        return Err(SyncError::Config(
            "target.clickhouse.progress_interval_ms must be at least 1".into(),
        ));
    }

    if let Some(ref clause) = spec.source.range_clause {
        let occurrences = clause.matches(MAX_PRIMARY_KEY_PLACEHOLDER).count();
        if occurrences != 1 {
            return Err(SyncError::Config(format!(
                "source.range_clause must contain {} exactly once, found {}",
                MAX_PRIMARY_KEY_PLACEHOLDER, occurrences
            )));
        }
        if spec.target.primary_key.as_deref().map_or(true, str::is_empty) {
            return Err(SyncError::Config(
                "target.primary_key is required when source.range_clause is set".into(),
            ));
        }
    }

    if let Some(ref schedule) = spec.schedule {
        schedule.interval()?;
    }

    Ok(())
}

/// Validate the migrations of one alias.
pub fn validate_migrations(alias: &str, migrations: &[MigrationRecord]) -> Result<()> {
    let mut seen = HashSet::new();
    for migration in migrations {
        if migration.version.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "migration version is required for {}",
                alias
            )));
        }
        if migration.query.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "migration {} for {} has an empty query",
                migration.version, alias
            )));
        }
        if !seen.insert(migration.version.as_str()) {
            return Err(SyncError::Config(format!(
                "duplicate migration version {} for {}",
                migration.version, alias
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClickHouseConfig, Lifecycle, MysqlConfig, Schedule, SourceConfig, TargetConfig};

    fn valid_spec() -> TransferSpec {
        TransferSpec {
            alias: "orders".to_string(),
            schedule: None,
            source: SourceConfig {
                mysql: MysqlConfig {
                    url: "mysql://sync:pw@localhost:3306/shop".to_string(),
                    username: None,
                    password: None,
                },
                query: "SELECT id, amount FROM orders".to_string(),
                range_clause: Some("WHERE id > ${max_primary_key}".to_string()),
            },
            target: TargetConfig {
                clickhouse: ClickHouseConfig {
                    url: "http://localhost:8123".to_string(),
                    db: "analytics".to_string(),
                    username: None,
                    password: None,
                    progress_interval_ms: 1000,
                    request_timeout_secs: 300,
                },
                primary_key: Some("id".to_string()),
                engine_definition: "ENGINE = MergeTree ORDER BY id".to_string(),
            },
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate(&valid_spec()).is_ok());
    }

    #[test]
    fn test_alias_charset() {
        let mut spec = valid_spec();
        spec.alias = "orders-v2".to_string();
        assert!(validate(&spec).is_err());

        spec.alias = String::new();
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("alias is required"));

        spec.alias = "a".repeat(MAX_ALIAS_LENGTH + 1);
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn test_missing_query() {
        let mut spec = valid_spec();
        spec.source.query = "   ".to_string();
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("source.query"));
    }

    #[test]
    fn test_missing_engine_definition() {
        let mut spec = valid_spec();
        spec.target.engine_definition = String::new();
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn test_range_clause_placeholder_exactly_once() {
        let mut spec = valid_spec();
        spec.source.range_clause = Some("WHERE id > 0".to_string());
        assert!(validate(&spec).is_err());

        spec.source.range_clause =
            Some("WHERE id > ${max_primary_key} OR id = ${max_primary_key}".to_string());
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn test_range_clause_requires_primary_key() {
        let mut spec = valid_spec();
        spec.target.primary_key = None;
        let err = validate(&spec).unwrap_err();
        assert!(err.to_string().contains("primary_key"));

        spec.source.range_clause = None;
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_invalid_schedule() {
        let mut spec = valid_spec();
        spec.schedule = Some(Schedule {
            interval: "soon".to_string(),
        });
        assert!(validate(&spec).is_err());
    }

    #[test]
    fn test_duplicate_migration_versions() {
        let m = |v: &str| MigrationRecord {
            version: v.to_string(),
            query: "ALTER TABLE orders ADD COLUMN x UInt8".to_string(),
            lifecycle: Lifecycle::Before,
        };
        assert!(validate_migrations("orders", &[m("1"), m("2")]).is_ok());
        let err = validate_migrations("orders", &[m("1"), m("1")]).unwrap_err();
        assert!(err.to_string().contains("duplicate migration version 1"));
    }
}

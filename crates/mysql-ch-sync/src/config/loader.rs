//! Alias directory discovery and YAML loading.

use super::{validate_migrations, MigrationRecord, TransferSpec};
use crate::error::{Result, SyncError};
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Per-alias transfer definition.
pub const TRANSFER_FILE: &str = "transfer.yml";

/// Fallback values merged under every alias's transfer definition.
pub const BASE_FILE: &str = "_transfer.yml";

const MIGRATIONS_DIR: &str = "migrations";

/// Everything loaded for one alias.
#[derive(Debug, Clone)]
pub struct AliasConfig {
    pub dir: PathBuf,
    pub spec: TransferSpec,
    /// Sorted by version.
    pub migrations: Vec<MigrationRecord>,
}

/// List alias directories under `home`, sorted by name.
///
/// Hidden directories and directories without a `transfer.yml` are skipped.
/// When `names` is given only those aliases are returned.
pub fn discover(home: &Path, names: Option<&[String]>) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(home)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || !path.is_dir() || !path.join(TRANSFER_FILE).is_file() {
            continue;
        }
        if let Some(names) = names {
            if !names.iter().any(|n| n == name) {
                continue;
            }
        }
        dirs.push(path);
    }
    dirs.sort();

    if let Some(names) = names {
        for name in names {
            if !dirs.iter().any(|d| d.file_name().and_then(|n| n.to_str()) == Some(name)) {
                warn!("No configuration directory found for alias {}", name);
            }
        }
    }

    Ok(dirs)
}

/// Load every discovered alias.
pub fn load_all(home: &Path, names: Option<&[String]>) -> Result<Vec<AliasConfig>> {
    discover(home, names)?
        .iter()
        .map(|dir| load_alias(dir))
        .collect()
}

/// Load one alias directory, resolving placeholders from the process environment.
pub fn load_alias(dir: &Path) -> Result<AliasConfig> {
    load_alias_with(dir, &|name| std::env::var(name).ok())
}

/// Load one alias directory with a custom placeholder lookup.
pub fn load_alias_with(dir: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> Result<AliasConfig> {
    let dir_name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SyncError::Config(format!("invalid alias directory {:?}", dir)))?
        .to_string();

    let mut value = read_yaml(&dir.join(TRANSFER_FILE), lookup)?;

    if let Some(home) = dir.parent() {
        let base_path = home.join(BASE_FILE);
        if base_path.is_file() {
            debug!("Using {:?} as fallback for {}", base_path, dir_name);
            let base = read_yaml(&base_path, lookup)?;
            value = merge(base, value);
        }
    }

    let mut spec: TransferSpec = serde_yaml::from_value(value)
        .map_err(|e| SyncError::Config(format!("{}: {}", dir.join(TRANSFER_FILE).display(), e)))?;
    if spec.alias.is_empty() {
        spec.alias = dir_name;
    }
    spec.validate()?;

    let migrations = load_migrations(&dir.join(MIGRATIONS_DIR), lookup)?;
    validate_migrations(&spec.alias, &migrations)?;

    Ok(AliasConfig {
        dir: dir.to_path_buf(),
        spec,
        migrations,
    })
}

fn load_migrations(
    dir: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<MigrationRecord>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        );
        if !is_yaml || !path.is_file() {
            continue;
        }
        let value = read_yaml(&path, lookup)?;
        let record: MigrationRecord = serde_yaml::from_value(value)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        migrations.push(record);
    }

    migrations.sort_by(|a, b| compare_versions(&a.version, &b.version));
    Ok(migrations)
}

/// Numeric order when both versions are integers, lexical otherwise.
pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn read_yaml(path: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    let replaced = substitute_placeholders(&raw, lookup)
        .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
    serde_yaml::from_str(&replaced)
        .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
}

/// Replace `{{NAME}}` with `lookup(NAME)`. Unresolved names are an error.
fn substitute_placeholders(
    raw: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> std::result::Result<String, String> {
    static PLACEHOLDER: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let placeholder = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}"))
        .as_ref()
        .map_err(|e| e.to_string())?;

    let mut missing = Vec::new();
    let replaced = placeholder.replace_all(raw, |caps: &Captures| match lookup(&caps[1]) {
        Some(v) => v,
        None => {
            missing.push(caps[1].to_string());
            String::new()
        }
    });

    if missing.is_empty() {
        Ok(replaced.into_owned())
    } else {
        Err(format!("unresolved placeholder(s): {}", missing.join(", ")))
    }
}

/// Deep-merge two mappings; values in `overlay` win.
fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

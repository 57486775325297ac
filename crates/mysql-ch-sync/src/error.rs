//! Error types for the sync library.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration error (invalid YAML, missing fields, unresolved placeholders, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A store could not be reached when the invocation started
    #[error("Cannot connect to {store}: {message}")]
    Connectivity { store: String, message: String },

    /// MySQL query error
    #[error("Source database error: {0}")]
    Source(#[from] mysql_async::Error),

    /// ClickHouse rejected a statement
    #[error("Destination error{}: {message}", code.map(|c| format!(" (code {})", c)).unwrap_or_default())]
    Destination { code: Option<u32>, message: String },

    /// Transport-level failure talking to ClickHouse
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The extraction query could not be described
    #[error("Schema introspection failed for {alias}: {message}")]
    SchemaIntrospection { alias: String, message: String },

    /// A source type could not be translated
    #[error("Type translation failed: {0}")]
    Translation(String),

    /// The latest ledger entry for this migration is a failure
    #[error("Migration {version} for {alias} previously failed - fix it manually before re-running")]
    LedgerConflict { alias: String, version: String },

    /// Migration DDL failed
    #[error("Migration {version} for {alias} failed: {message}")]
    Migration {
        alias: String,
        version: String,
        message: String,
    },

    /// Data transfer failed for a specific alias
    #[error("Transfer failed for {alias}: {message}")]
    Transfer { alias: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a Connectivity error for the named store
    pub fn connectivity(store: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Connectivity {
            store: store.into(),
            message: message.to_string(),
        }
    }

    /// Create a Destination error without a server code
    pub fn destination(message: impl Into<String>) -> Self {
        SyncError::Destination {
            code: None,
            message: message.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(alias: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Transfer {
            alias: alias.into(),
            message: message.to_string(),
        }
    }

    /// Whether a later scheduled attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::Config(_)
                | SyncError::Yaml(_)
                | SyncError::LedgerConflict { .. }
                | SyncError::SchemaIntrospection { .. }
                | SyncError::Translation(_)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Config(_) | SyncError::Yaml(_) => 1,
            SyncError::Connectivity { .. } => 2,
            SyncError::Source(_) | SyncError::Destination { .. } | SyncError::Http(_) => 3,
            SyncError::Transfer { .. } => 4,
            SyncError::LedgerConflict { .. } | SyncError::Migration { .. } => 5,
            SyncError::SchemaIntrospection { .. } | SyncError::Translation(_) => 6,
            SyncError::Io(_) => 7,
            SyncError::Json(_) => 8,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

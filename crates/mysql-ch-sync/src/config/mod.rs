//! Configuration loading and validation.
//!
//! A home directory holds one subdirectory per alias:
//!
//! ```text
//! home/
//!   _transfer.yml          # optional, fallback values for every alias
//!   orders/
//!     transfer.yml
//!     migrations/
//!       001_add_column.yml
//! ```

mod loader;
mod types;
mod validation;

pub use loader::{discover, load_alias, load_alias_with, load_all, AliasConfig, BASE_FILE, TRANSFER_FILE};
pub use types::*;
pub use validation::validate_migrations;

use crate::error::Result;

impl TransferSpec {
    /// Parse and validate a transfer spec from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: TransferSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check the transfer definition for missing or inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

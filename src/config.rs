//! Store configuration.
//!
//! ```json
//! {
//!   "backend": { "type": "sqlite", "path": "./data/nocode.db" },
//!   "bootstrap": "conditional",
//!   "counter_seed": 10004321,
//!   "operation_timeout_ms": 5000,
//!   "check_unique_on_update": true,
//!   "cascade_unique_markers": true
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::counter::{BootstrapMode, COUNTER_SEED};
use crate::error::{Result, StoreError};

#[cfg(feature = "dynamodb")]
use crate::dynamodb::DynamoDbConfig;

/// Default table name for remote backends.
pub const DEFAULT_TABLE_NAME: &str = "nocode";

/// Which key-range table backs the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local table, lost on exit.
    #[default]
    Memory,
    /// SQLite database file, created if missing.
    Sqlite { path: PathBuf },
    /// Amazon DynamoDB table with a `(PK, SK2)` secondary index.
    #[cfg(feature = "dynamodb")]
    #[serde(rename = "dynamodb")]
    DynamoDb(DynamoDbConfig),
}

/// Configuration for a [`ResourceStore`](crate::ResourceStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backing table.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Counter bootstrap strategy (default: conditional).
    #[serde(default)]
    pub bootstrap: BootstrapMode,

    /// First id handed out in each collection (default: 10004321).
    #[serde(default = "default_counter_seed")]
    pub counter_seed: i64,

    /// Per table-operation timeout in milliseconds (default: none).
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    /// Re-run the advisory unique check on update (default: true).
    #[serde(default = "default_true")]
    pub check_unique_on_update: bool,

    /// Retire a resource's unique markers when it is deleted (default: true).
    #[serde(default = "default_true")]
    pub cascade_unique_markers: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            bootstrap: BootstrapMode::default(),
            counter_seed: default_counter_seed(),
            operation_timeout_ms: None,
            check_unique_on_update: true,
            cascade_unique_markers: true,
        }
    }
}

impl StoreConfig {
    /// In-memory store with default settings.
    pub fn memory() -> Self {
        Self::default()
    }

    /// SQLite-backed store at `path`.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Sqlite { path: path.into() },
            ..Self::default()
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Set the bootstrap mode.
    pub fn with_bootstrap(mut self, mode: BootstrapMode) -> Self {
        self.bootstrap = mode;
        self
    }

    /// Set the per-operation timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.operation_timeout_ms = Some(timeout_ms);
        self
    }

    /// Enable or disable marker cleanup on delete.
    pub fn with_cascade(mut self, cascade: bool) -> Self {
        self.cascade_unique_markers = cascade;
        self
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.counter_seed < 1 {
            return Err(StoreError::Config(format!(
                "counter_seed must be positive, got {}",
                self.counter_seed
            )));
        }
        if self.operation_timeout_ms == Some(0) {
            return Err(StoreError::Config(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_counter_seed() -> i64 {
    COUNTER_SEED
}

fn default_true() -> bool {
    true
}

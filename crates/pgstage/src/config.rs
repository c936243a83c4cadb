//! Pipeline configuration
//!
//! A pipeline is described by one TOML file:
//!
//! ```toml
//! [database]
//! url = "postgresql://localhost/warehouse"
//!
//! [[prep]]
//! fixed_statement = "CREATE TABLE IF NOT EXISTS events (id bigint primary key, kind text)"
//!
//! [write]
//! table_name = "events"
//! conflict_index = "id"
//! max_rows_per_statement = 500
//! ```
//!
//! `DATABASE_URL` and `DB_*` environment variables override the `[database]` table.

use crate::db::DbConfig;
use crate::statement::WriteTarget;
use pgstage_common::config::read_toml_file;
use pgstage_common::{CommonError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of units a write stage processes at once.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 1;

/// Default number of times a passthrough statement runs.
pub const DEFAULT_MAX_EXECUTIONS: u64 = 1;

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY_LEVEL
}

fn default_max_executions() -> u64 {
    DEFAULT_MAX_EXECUTIONS
}

/// Settings for a [`WriteStage`](crate::WriteStage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStageConfig {
    pub table_name: String,
    /// Run verbatim inside the first unit's transaction
    #[serde(default)]
    pub delete_statement: Option<String>,
    #[serde(default = "default_true")]
    pub upsert_enabled: bool,
    /// Conflict target; required when `upsert_enabled`, checked when a statement is built
    #[serde(default)]
    pub conflict_index: Option<String>,
    /// Empty updates every column of the batch
    #[serde(default)]
    pub conflict_update_columns: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency_level: usize,
    /// Zero or negative writes each unit as a single statement
    #[serde(default)]
    pub max_rows_per_statement: i64,
}

impl WriteStageConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            delete_statement: None,
            upsert_enabled: true,
            conflict_index: None,
            conflict_update_columns: Vec::new(),
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            max_rows_per_statement: 0,
        }
    }

    pub fn write_target(&self) -> WriteTarget {
        WriteTarget {
            table_name: self.table_name.clone(),
            upsert_enabled: self.upsert_enabled,
            conflict_index: self.conflict_index.clone().unwrap_or_default(),
            conflict_update_columns: self.conflict_update_columns.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            return Err(CommonError::config("write.table_name cannot be empty"));
        }
        if self.concurrency_level == 0 {
            return Err(CommonError::config("write.concurrency_level must be greater than 0"));
        }
        if matches!(&self.delete_statement, Some(sql) if sql.trim().is_empty()) {
            return Err(CommonError::config("write.delete_statement cannot be blank"));
        }
        Ok(())
    }
}

/// Settings for a [`PassthroughStage`](crate::PassthroughStage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassthroughConfig {
    /// Absence is reported when the stage first needs it, not at load time
    #[serde(default)]
    pub fixed_statement: Option<String>,
    #[serde(default = "default_max_executions")]
    pub max_executions: u64,
}

impl PassthroughConfig {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            fixed_statement: Some(statement.into()),
            max_executions: DEFAULT_MAX_EXECUTIONS,
        }
    }
}

/// A whole `prep* -> write` pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DbConfig,
    /// Passthrough stages run in order ahead of the writer
    #[serde(default)]
    pub prep: Vec<PassthroughConfig>,
    pub write: WriteStageConfig,
}

impl PipelineConfig {
    pub fn new(write: WriteStageConfig) -> Self {
        Self {
            database: DbConfig::default(),
            prep: Vec::new(),
            write,
        }
    }

    /// Read `path`, apply environment overrides, and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config: PipelineConfig = read_toml_file(path)?;
        config.database = config
            .database
            .merge_env()
            .map_err(|e| CommonError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.database
            .validate()
            .map_err(|e| CommonError::config(e.to_string()))?;
        self.write.validate()
    }
}

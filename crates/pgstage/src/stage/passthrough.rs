//! Passthrough stage that runs a fixed statement a bounded number of times
//!
//! Used to slot maintenance work (`VACUUM`, `CREATE INDEX`, ...) into a data flow.
//! Every unit is forwarded unchanged; the first `max_executions` units additionally
//! run the statement, outside any transaction, before being forwarded.

use super::{fault_boundary, Outbound, Stage};
use crate::cancel::KillSwitch;
use crate::config::PassthroughConfig;
use crate::db::Database;
use crate::error::{FatalError, Result, SinkError};
use crate::payload::Payload;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const DEFAULT_NAME: &str = "SqlPassthrough";

pub struct PassthroughStage {
    name: String,
    db: Arc<dyn Database>,
    statement: Option<String>,
    max_executions: u64,
    executions: Mutex<u64>,
}

impl PassthroughStage {
    pub fn new(db: Arc<dyn Database>, statement: Option<String>, max_executions: u64) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            db,
            statement,
            max_executions,
            executions: Mutex::new(0),
        }
    }

    pub fn from_config(db: Arc<dyn Database>, config: &PassthroughConfig) -> Self {
        Self::new(db, config.fixed_statement.clone(), config.max_executions)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Times the statement has been attempted
    pub async fn executions(&self) -> u64 {
        *self.executions.lock().await
    }

    /// Run the statement if executions remain. Returns whether it ran.
    async fn maybe_execute(&self) -> Result<bool> {
        let mut executions = self.executions.lock().await;
        if *executions >= self.max_executions {
            return Ok(false);
        }
        *executions += 1;

        let statement = self
            .statement
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SinkError::configuration("no fixed statement configured"))?;

        info!(stage = %self.name, execution = *executions, max = self.max_executions, "Executing statement");
        let affected = self.db.execute(statement).await.map_err(SinkError::execution)?;
        debug!(stage = %self.name, rows_affected = affected, "Statement complete");
        Ok(true)
    }
}

#[async_trait]
impl Stage for PassthroughStage {
    async fn process_unit(&self, unit: Payload, out: &Outbound, kill: &KillSwitch) {
        if kill.is_cancelled() {
            return;
        }

        if let Err(err) = fault_boundary(self.maybe_execute()).await {
            kill.report_fatal(FatalError::new(self.name.clone(), err));
            return;
        }

        if !out.send(unit, kill).await {
            debug!(stage = %self.name, "Downstream closed, dropping unit");
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

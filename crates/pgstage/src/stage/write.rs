//! Transactional write stage
//!
//! Each unit is written inside its own transaction:
//!
//! 1. take a ticket from the delete gate, in arrival order
//! 2. begin; on the very first invocation only, run the configured delete statement
//!    while still holding the gate
//! 3. decode the unit (row data, or an override naming another table)
//! 4. write it through the [`BatchExecutor`]
//! 5. commit
//!
//! The stage is a sink: nothing is forwarded downstream.

use super::{fault_boundary, Outbound, Stage};
use crate::cancel::KillSwitch;
use crate::config::WriteStageConfig;
use crate::db::{Database, Transaction};
use crate::error::{FatalError, Result, SinkError};
use crate::executor::{BatchExecutor, BatchingPolicy, ExecutionSummary};
use crate::payload::{Payload, WriteRequest};
use crate::statement::WriteTarget;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const DEFAULT_NAME: &str = "PostgresWriter";

pub struct WriteStage {
    name: String,
    db: Arc<dyn Database>,
    target: WriteTarget,
    delete_statement: Option<String>,
    executor: BatchExecutor,
    concurrency: usize,
    /// Units that passed the delete gate; the first unit holds the lock from before
    /// `begin` until its delete has run
    invocations: Mutex<u64>,
}

/// Diagnostic context for a unit, filled in as processing advances
struct UnitContext {
    table: String,
    rows: usize,
}

enum Outcome {
    Committed {
        summary: ExecutionSummary,
        overridden: bool,
    },
    /// Cancellation was observed before commit; the transaction was rolled back
    Abandoned,
}

impl WriteStage {
    pub fn new(db: Arc<dyn Database>, target: WriteTarget) -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            db,
            target,
            delete_statement: None,
            executor: BatchExecutor::default(),
            concurrency: 1,
            invocations: Mutex::new(0),
        }
    }

    pub fn from_config(db: Arc<dyn Database>, config: &WriteStageConfig) -> Self {
        let mut stage = Self::new(db, config.write_target())
            .with_policy(BatchingPolicy::max_rows(config.max_rows_per_statement))
            .with_concurrency(config.concurrency_level);
        stage.delete_statement = config.delete_statement.clone();
        stage
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Statement run once, inside the first unit's transaction
    pub fn with_delete(mut self, statement: impl Into<String>) -> Self {
        self.delete_statement = Some(statement.into());
        self
    }

    pub fn with_policy(mut self, policy: BatchingPolicy) -> Self {
        self.executor = BatchExecutor::new(policy);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn target(&self) -> &WriteTarget {
        &self.target
    }

    /// Number of units that have passed the delete gate
    pub async fn invocations(&self) -> u64 {
        *self.invocations.lock().await
    }

    /// Claim this unit's place at the delete gate before any transaction exists.
    ///
    /// Returns the held gate when this unit must run the delete; every other unit is
    /// counted and the gate released immediately.
    async fn pass_gate(&self) -> Option<MutexGuard<'_, u64>> {
        let mut invocations = self.invocations.lock().await;
        if *invocations == 0 && self.delete_statement.is_some() {
            Some(invocations)
        } else {
            *invocations += 1;
            None
        }
    }

    async fn write(&self, unit: &Payload, kill: &KillSwitch, ctx: &mut UnitContext) -> Result<Outcome> {
        let gate = self.pass_gate().await;
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| SinkError::transaction("begin", e))?;

        let written = self.write_in(tx.as_mut(), gate, unit, ctx).await;

        match written {
            Ok((summary, overridden)) => {
                if kill.is_cancelled() {
                    debug!(stage = %self.name, table = %ctx.table, "Pipeline cancelled before commit, rolling back");
                    self.rollback(tx).await;
                    return Ok(Outcome::Abandoned);
                }
                tx.commit()
                    .await
                    .map_err(|e| SinkError::transaction("commit", e))?;
                Ok(Outcome::Committed { summary, overridden })
            },
            Err(err) => {
                self.rollback(tx).await;
                Err(err)
            },
        }
    }

    async fn write_in(
        &self,
        tx: &mut dyn Transaction,
        gate: Option<MutexGuard<'_, u64>>,
        unit: &Payload,
        ctx: &mut UnitContext,
    ) -> Result<(ExecutionSummary, bool)> {
        if let Some(mut invocations) = gate {
            if let Some(delete) = &self.delete_statement {
                info!(stage = %self.name, table = %self.target.table_name, "Running one-time delete");
                let deleted = tx.execute(delete, &[]).await.map_err(SinkError::execution)?;
                debug!(stage = %self.name, rows_affected = deleted, "One-time delete complete");
            }
            *invocations += 1;
        }

        let request = WriteRequest::decode(unit)?;
        let target = match request.override_table() {
            Some(table) => {
                debug!(stage = %self.name, table, "Unit overrides write target");
                self.target.retarget(table)
            },
            None => self.target.clone(),
        };
        ctx.table = target.table_name.clone();
        ctx.rows = request.batch().len();

        let summary = self.executor.execute(tx, request.batch(), &target).await?;
        Ok((summary, request.override_table().is_some()))
    }

    async fn rollback(&self, tx: Box<dyn Transaction>) {
        if let Err(e) = tx.rollback().await {
            warn!(stage = %self.name, error = %e, "Rollback failed");
        }
    }
}

#[async_trait]
impl Stage for WriteStage {
    async fn process_unit(&self, unit: Payload, _out: &Outbound, kill: &KillSwitch) {
        if kill.is_cancelled() {
            debug!(stage = %self.name, "Pipeline cancelled, skipping unit");
            return;
        }

        let mut ctx = UnitContext {
            table: self.target.table_name.clone(),
            rows: 0,
        };

        match fault_boundary(self.write(&unit, kill, &mut ctx)).await {
            Ok(Outcome::Committed { summary, overridden }) => {
                info!(
                    stage = %self.name,
                    table = %ctx.table,
                    rows = ctx.rows,
                    statements = summary.statements,
                    rows_affected = summary.rows_affected,
                    overridden,
                    "Write complete"
                );
            },
            Ok(Outcome::Abandoned) => {},
            Err(err) => {
                kill.report_fatal(
                    FatalError::new(self.name.clone(), err)
                        .with_table(ctx.table)
                        .with_rows(ctx.rows),
                );
            },
        }
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn name(&self) -> &str {
        &self.name
    }
}

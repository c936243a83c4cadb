//! Batch execution
//!
//! Splits a batch into chunks, compiles each chunk against the write target and runs
//! the chunks one after another on the caller's transaction. The executor never
//! commits or rolls back; that belongs to whoever opened the transaction.

use crate::db::{Database, Transaction};
use crate::error::{Result, SinkError};
use crate::record::{normalize, Batch, Record};
use crate::statement::{compile_insert, compile_literal_insert, WriteTarget};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How many rows a single statement may carry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingPolicy {
    /// Zero or negative disables splitting
    pub max_rows_per_statement: i64,
}

impl BatchingPolicy {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn max_rows(max_rows_per_statement: i64) -> Self {
        Self {
            max_rows_per_statement,
        }
    }

    /// Chunk size for a batch of `len` rows; never zero
    fn chunk_size(&self, len: usize) -> usize {
        match usize::try_from(self.max_rows_per_statement) {
            Ok(n) if n > 0 => n,
            _ => len.max(1),
        }
    }

    /// Order-preserving, disjoint slices covering `records`
    pub fn chunks<'a>(&self, records: &'a [Record]) -> std::slice::Chunks<'a, Record> {
        records.chunks(self.chunk_size(records.len()))
    }
}

/// What a batch write did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub statements: usize,
    pub rows_affected: u64,
}

impl ExecutionSummary {
    fn record(&mut self, rows_affected: u64) {
        self.statements += 1;
        self.rows_affected += rows_affected;
    }
}

/// Drives chunks of a batch through the compiler and a transaction
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchExecutor {
    policy: BatchingPolicy,
}

impl BatchExecutor {
    pub fn new(policy: BatchingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BatchingPolicy {
        self.policy
    }

    /// Write `batch` into `target` on `tx`, stopping at the first failing chunk.
    ///
    /// An empty batch issues no statements.
    pub async fn execute(
        &self,
        tx: &mut dyn Transaction,
        batch: &Batch,
        target: &WriteTarget,
    ) -> Result<ExecutionSummary> {
        target.validate()?;

        let mut summary = ExecutionSummary::default();
        for (chunk_idx, chunk) in self.policy.chunks(batch.records()).enumerate() {
            let statement = compile_insert(normalize(chunk), target)?;
            debug!(
                table = %target.table_name,
                chunk = chunk_idx,
                rows = chunk.len(),
                sql = %statement.sql,
                "Executing chunk"
            );

            let affected = tx
                .execute(&statement.sql, &statement.args)
                .await
                .map_err(SinkError::execution)?;
            summary.record(affected);
        }

        Ok(summary)
    }
}

/// Insert `batch` with literal statements run directly on `db`, outside any
/// transaction.
///
/// **Trusted input only**: values are inlined as SQL text (see
/// [`compile_literal_insert`]). Chunks already written stay written when a later
/// chunk fails.
pub async fn insert_without_transaction(
    db: &dyn Database,
    batch: &Batch,
    table_name: &str,
    policy: BatchingPolicy,
) -> Result<ExecutionSummary> {
    let mut summary = ExecutionSummary::default();
    for chunk in policy.chunks(batch.records()) {
        let sql = compile_literal_insert(&normalize(chunk), table_name)?;
        debug!(table = table_name, rows = chunk.len(), "Executing literal insert");

        let affected = db.execute(&sql).await.map_err(SinkError::execution)?;
        summary.record(affected);
    }

    debug!(
        table = table_name,
        statements = summary.statements,
        rows_affected = summary.rows_affected,
        "Literal insert complete"
    );
    Ok(summary)
}

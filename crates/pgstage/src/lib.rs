//! pgstage
//!
//! Conflict-aware bulk PostgreSQL writes for multi-stage data pipelines.
//!
//! Units of JSON records flow through a [`Pipeline`] of [`Stage`]s. A [`WriteStage`]
//! normalizes each unit into a column set, compiles it into parameterized multi-row
//! `INSERT ... ON CONFLICT` statements and writes it in one transaction. A
//! [`PassthroughStage`] interleaves bounded maintenance statements into the flow. The
//! first fatal error anywhere trips the shared [`KillSwitch`] and stops every stage.
//!
//! ```no_run
//! use pgstage::{KillSwitch, MemoryDatabase, Payload, Pipeline, WriteStage, WriteTarget};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), pgstage::FatalError> {
//! let db = Arc::new(MemoryDatabase::new());
//! let writer = WriteStage::new(db, WriteTarget::upsert("events", "id"));
//!
//! let units = vec![Payload::from(r#"[{"id": 1, "kind": "click"}]"#)];
//! let report = Pipeline::new()
//!     .stage(writer)
//!     .run_with(KillSwitch::new(), futures::stream::iter(units))
//!     .await?;
//! assert_eq!(report.units_in, 1);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod payload;
pub mod pipeline;
pub mod record;
pub mod stage;
pub mod statement;

pub use cancel::KillSwitch;
pub use config::{PassthroughConfig, PipelineConfig, WriteStageConfig};
pub use db::{Database, DbConfig, DbError, MemoryDatabase, PgDatabase, Transaction};
pub use error::{ErrorKind, FatalError, Result, SinkError};
pub use executor::{insert_without_transaction, BatchExecutor, BatchingPolicy, ExecutionSummary};
pub use payload::{Payload, WriteRequest, WriteTargetOverride};
pub use pipeline::{Pipeline, PipelineReport};
pub use record::{normalize, Batch, ColumnSet, NormalizedBatch, Record};
pub use stage::{Outbound, PassthroughStage, Stage, WriteStage};
pub use statement::{compile_insert, compile_literal_insert, CompiledStatement, WriteTarget};

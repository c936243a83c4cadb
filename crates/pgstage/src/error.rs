//! Error types for pgstage
//!
//! Every failure inside a stage is one of the [`SinkError`] kinds. Once it leaves the
//! stage it is wrapped into a [`FatalError`] carrying enough context (stage, table,
//! rows attempted) to diagnose the failure without re-running the pipeline.

use thiserror::Error;

/// Result type for statement building and execution
pub type Result<T> = std::result::Result<T, SinkError>;

/// Classification of a [`SinkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedInput,
    InvalidTarget,
    ExecutionFailure,
    TransactionFailure,
    ConfigurationError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::ExecutionFailure => "execution_failure",
            ErrorKind::TransactionFailure => "transaction_failure",
            ErrorKind::ConfigurationError => "configuration_error",
        };
        f.write_str(label)
    }
}

/// Errors raised while normalizing, compiling, or writing a unit of work.
///
/// All kinds are pipeline-fatal; nothing here is retried.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Payload is not decodable into key/value rows
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Write target cannot produce a valid statement
    #[error("Invalid write target: {0}")]
    InvalidTarget(String),

    /// The database rejected a statement, or processing faulted
    #[error("Statement execution failed: {0}")]
    Execution(String),

    /// begin/commit/rollback itself failed
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Required static configuration is absent
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::MalformedInput(_) => ErrorKind::MalformedInput,
            SinkError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            SinkError::Execution(_) => ErrorKind::ExecutionFailure,
            SinkError::Transaction(_) => ErrorKind::TransactionFailure,
            SinkError::Configuration(_) => ErrorKind::ConfigurationError,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput(message.into())
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::InvalidTarget(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wrap a statement failure reported by the database
    pub fn execution(err: impl std::fmt::Display) -> Self {
        Self::Execution(err.to_string())
    }

    /// Wrap a begin/commit/rollback failure reported by the database
    pub fn transaction(action: &str, err: impl std::fmt::Display) -> Self {
        Self::Transaction(format!("{} failed: {}", action, err))
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::MalformedInput(err.to_string())
    }
}

/// A pipeline-fatal error as reported through the [`KillSwitch`](crate::KillSwitch)
#[derive(Error, Debug)]
#[error(
    "{stage}: {source} (table: {}, rows attempted: {rows_attempted})",
    .table.as_deref().unwrap_or("-")
)]
pub struct FatalError {
    /// Diagnostic name of the stage that failed
    pub stage: String,
    /// Table the stage was writing to, when known
    pub table: Option<String>,
    /// Number of records in the unit being processed
    pub rows_attempted: usize,
    #[source]
    pub source: SinkError,
}

impl FatalError {
    pub fn new(stage: impl Into<String>, source: SinkError) -> Self {
        Self {
            stage: stage.into(),
            table: None,
            rows_attempted: 0,
            source,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows_attempted = rows;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(SinkError::malformed("x").kind(), ErrorKind::MalformedInput);
        assert_eq!(SinkError::invalid_target("x").kind(), ErrorKind::InvalidTarget);
        assert_eq!(SinkError::execution("boom").kind(), ErrorKind::ExecutionFailure);
        assert_eq!(
            SinkError::transaction("commit", "gone").kind(),
            ErrorKind::TransactionFailure
        );
        assert_eq!(SinkError::configuration("x").kind(), ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_fatal_error_display_carries_context() {
        let err = FatalError::new("PostgresWriter", SinkError::execution("duplicate key"))
            .with_table("events")
            .with_rows(12);

        let text = err.to_string();
        assert!(text.starts_with("PostgresWriter: Statement execution failed: duplicate key"));
        assert!(text.contains("table: events"));
        assert!(text.contains("rows attempted: 12"));
        assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    }

    #[test]
    fn test_fatal_error_without_table() {
        let err = FatalError::new("SqlPassthrough", SinkError::configuration("no statement"));
        assert!(err.to_string().contains("table: -"));
    }
}

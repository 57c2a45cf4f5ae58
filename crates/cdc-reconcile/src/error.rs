//! Error types for the reconciliation engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for reconciliation operations.
///
/// Data mismatches are never errors: count and checksum differences are
/// reported through `ComparisonResult`. Errors are connectivity, query,
/// configuration and persistence failures.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient network or connection failure (retryable)
    #[error("Connection error ({backend}): {message}")]
    Connectivity { backend: String, message: String },

    /// Operation exceeded its deadline (retryable)
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Deadlock or serialization failure reported by the server (retryable)
    #[error("Deadlock detected ({backend}): {message}")]
    Deadlock { backend: String, message: String },

    /// No connection became available before the acquisition timeout
    #[error("Pool exhausted ({backend}): no connection available after {waited:?}")]
    PoolExhausted { backend: String, waited: Duration },

    /// Pool was closed and rejects further acquisitions
    #[error("Pool closed ({backend})")]
    PoolClosed { backend: String },

    /// Login rejected by the server
    #[error("Authentication failed ({backend}): {message}")]
    Authentication { backend: String, message: String },

    /// Syntax, permission, constraint or conversion failure
    #[error("Query failed ({backend}): {message}")]
    Query { backend: String, message: String },

    /// Checkpoint could not be persisted; the previous checkpoint remains
    #[error("Checkpoint write failed for table {table}: {message}")]
    CheckpointWrite { table: String, message: String },

    /// Checkpoint could not be read or failed its integrity check
    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    /// Retry policy gave up
    #[error("Gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<ReconcileError>,
    },

    /// Worker task panicked or was aborted
    #[error("Worker failure: {0}")]
    Worker(String),

    /// Run was cancelled before the job was dispatched
    #[error("Reconciliation cancelled")]
    Cancelled,

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

impl ReconcileError {
    /// Create a Connectivity error.
    pub fn connectivity(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Connectivity {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a Query error.
    pub fn query(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Query {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a Timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        ReconcileError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a CheckpointWrite error.
    pub fn checkpoint_write(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::CheckpointWrite {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Default transient/fatal classification used by the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Connectivity { .. }
                | ReconcileError::Timeout { .. }
                | ReconcileError::Deadlock { .. }
        )
    }

    /// Error that invalidates the connection it happened on.
    ///
    /// Such connections are discarded instead of returned to the pool.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            ReconcileError::Connectivity { .. } | ReconcileError::Timeout { .. }
        )
    }

    /// Innermost error, looking through retry exhaustion.
    pub fn root_cause(&self) -> &ReconcileError {
        match self {
            ReconcileError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self.root_cause() {
            ReconcileError::Config(_) | ReconcileError::Yaml(_) => 2,
            ReconcileError::Authentication { .. } => 3,
            ReconcileError::Connectivity { .. }
            | ReconcileError::PoolExhausted { .. }
            | ReconcileError::PoolClosed { .. }
            | ReconcileError::Timeout { .. } => 4,
            ReconcileError::Cancelled => 130,
            _ => 1,
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

/// SQL Server error numbers that classify driver failures.
const MSSQL_DEADLOCK_VICTIM: u32 = 1205;
const MSSQL_LOCK_TIMEOUT: u32 = 1222;
const MSSQL_LOGIN_FAILED: u32 = 18456;

impl From<tiberius::error::Error> for ReconcileError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error as TdsError;

        const BACKEND: &str = "mssql";
        match err {
            TdsError::Io { .. } | TdsError::Tls(_) | TdsError::Routing { .. } => {
                ReconcileError::connectivity(BACKEND, err.to_string())
            }
            TdsError::Server(ref token) => match token.code() {
                MSSQL_DEADLOCK_VICTIM | MSSQL_LOCK_TIMEOUT => ReconcileError::Deadlock {
                    backend: BACKEND.to_string(),
                    message: token.message().to_string(),
                },
                MSSQL_LOGIN_FAILED => ReconcileError::Authentication {
                    backend: BACKEND.to_string(),
                    message: token.message().to_string(),
                },
                _ => ReconcileError::query(BACKEND, err.to_string()),
            },
            other => ReconcileError::query(BACKEND, other.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for ReconcileError {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        const BACKEND: &str = "postgres";
        let message = match err.as_db_error() {
            Some(db) => db.message().to_string(),
            None => err.to_string(),
        };

        match err.code() {
            Some(code)
                if *code == SqlState::T_R_DEADLOCK_DETECTED
                    || *code == SqlState::T_R_SERIALIZATION_FAILURE =>
            {
                ReconcileError::Deadlock {
                    backend: BACKEND.to_string(),
                    message,
                }
            }
            Some(code) if *code == SqlState::QUERY_CANCELED => ReconcileError::Timeout {
                operation: format!("postgres query ({})", message),
                after: Duration::ZERO,
            },
            Some(code) if code.code().starts_with("08") || code.code().starts_with("57P") => {
                ReconcileError::connectivity(BACKEND, message)
            }
            Some(code) if code.code().starts_with("28") => ReconcileError::Authentication {
                backend: BACKEND.to_string(),
                message,
            },
            Some(_) => ReconcileError::query(BACKEND, message),
            None if err.is_closed() => ReconcileError::connectivity(BACKEND, message),
            None => {
                let io_failure = std::error::Error::source(&err)
                    .map(|source| source.is::<std::io::Error>())
                    .unwrap_or(false);
                if io_failure {
                    ReconcileError::connectivity(BACKEND, message)
                } else {
                    ReconcileError::query(BACKEND, message)
                }
            }
        }
    }
}

/// A fatal error annotated with the table and operation it occurred in.
#[derive(Error, Debug)]
#[error("{table}: {operation} failed: {cause}")]
pub struct JobFailure {
    /// Qualified table name (`schema.table`).
    pub table: String,
    /// Operation that failed (e.g. `row_count`, `checksum`, `save_checkpoint`).
    pub operation: String,
    /// Underlying error.
    #[source]
    pub cause: ReconcileError,
}

impl JobFailure {
    pub fn new(table: impl Into<String>, operation: impl Into<String>, cause: ReconcileError) -> Self {
        Self {
            table: table.into(),
            operation: operation.into(),
            cause,
        }
    }
}

/// Attach table context to a fallible step of a job.
pub trait JobContext<T> {
    fn in_job(self, table: &str, operation: &str) -> std::result::Result<T, JobFailure>;
}

impl<T> JobContext<T> for Result<T> {
    fn in_job(self, table: &str, operation: &str) -> std::result::Result<T, JobFailure> {
        self.map_err(|e| JobFailure::new(table, operation, e))
    }
}

/// Result type alias for reconciliation operations.
pub type Result<T> = std::result::Result<T, ReconcileError>;

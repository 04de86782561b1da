//! Error types for kudu-connect
//!
//! Errors are classified by how the write pipeline must react to them:
//! - Per-record errors that repetition can never fix (routing, schema mismatch)
//! - Per-row write errors, either transient (retried with backoff) or permanent
//! - Task-level escalations (no reachable master, exhausted retries)

use std::fmt;
use thiserror::Error;

/// Result type for kudu-connect operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Target table could not be resolved for a record
    Routing,
    /// Record value incompatible with the table columns
    Schema,
    /// Timeout, unavailable master, leadership change (retriable)
    Transient,
    /// Row rejected by the cluster (not retriable)
    NonRetryable,
    /// No master reachable (escalates immediately)
    FatalConnection,
    /// Retry budget spent on transient failures
    RetriesExhausted,
    /// Configuration error
    Configuration,
    /// Shutdown in progress
    Shutdown,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are worth retrying
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether an error in this category must fail the whole task
    #[inline]
    pub const fn is_task_fatal(self) -> bool {
        matches!(
            self,
            Self::Routing
                | Self::Schema
                | Self::NonRetryable
                | Self::FatalConnection
                | Self::RetriesExhausted
                | Self::Other
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Routing => "routing",
            Self::Schema => "schema",
            Self::Transient => "transient",
            Self::NonRetryable => "non_retryable",
            Self::FatalConnection => "fatal_connection",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Configuration => "configuration",
            Self::Shutdown => "shutdown",
            Self::Other => "other",
        };
        write!(f, "{}", name)
    }
}

/// Main error type for kudu-connect
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum ConnectError {
    /// Target table unresolvable for a record
    #[error("routing error: {message}")]
    Routing { message: String },

    /// Record value incompatible with the target table
    #[error("schema mismatch for table '{table}': {message}")]
    SchemaMismatch { table: String, message: String },

    /// Timeout, master unavailable or leadership change
    #[error("transient write error: {message}")]
    TransientWrite {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Constraint violation or malformed row
    #[error("non-retryable write error: {message}")]
    NonRetryableWrite { message: String },

    /// Session establishment failed against every configured master
    #[error("fatal connection error: {message}")]
    FatalConnection { message: String },

    /// Transient failures outlasted the retry budget
    #[error("retries exhausted for table '{table}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        table: String,
        attempts: u32,
        last_error: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The task already failed; carries the original cause
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Shutdown requested
    #[error("shutdown requested")]
    Shutdown,

    /// Unexpected internal failure (panicked worker, broken invariant)
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConnectError {
    /// Create a routing error
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create a schema mismatch error
    pub fn schema_mismatch(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a transient write error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientWrite {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient write error with source
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransientWrite {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a non-retryable write error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryableWrite {
            message: message.into(),
        }
    }

    /// Create a fatal connection error
    pub fn fatal_connection(message: impl Into<String>) -> Self {
        Self::FatalConnection {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Routing { .. } => ErrorCategory::Routing,
            Self::SchemaMismatch { .. } => ErrorCategory::Schema,
            Self::TransientWrite { .. } | Self::Io(_) => ErrorCategory::Transient,
            Self::NonRetryableWrite { .. } => ErrorCategory::NonRetryable,
            Self::FatalConnection { .. } => ErrorCategory::FatalConnection,
            Self::RetriesExhausted { .. } => ErrorCategory::RetriesExhausted,
            Self::Config(_) | Self::Yaml(_) | Self::Json(_) => ErrorCategory::Configuration,
            Self::Shutdown => ErrorCategory::Shutdown,
            Self::TaskFailed(_) | Self::Internal(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error was caused by a shutdown
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Normalize an error returned by a session call into the per-row write
    /// taxonomy. Anything that is not already a write error is treated as a
    /// rejection of the row, except IO failures which are transient.
    pub fn into_write_error(self) -> Self {
        match self {
            Self::TransientWrite { .. }
            | Self::NonRetryableWrite { .. }
            | Self::FatalConnection { .. }
            | Self::Shutdown => self,
            Self::Io(e) => Self::transient_with_source("session io failure", e),
            other => Self::non_retryable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectError::schema_mismatch("orders", "column 'id' expects int64");
        assert_eq!(
            err.to_string(),
            "schema mismatch for table 'orders': column 'id' expects int64"
        );

        let err = ConnectError::RetriesExhausted {
            table: "orders".into(),
            attempts: 3,
            last_error: "timed out".into(),
        };
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_error_categories() {
        assert!(ConnectError::transient("leader changed").is_retriable());
        assert!(!ConnectError::non_retryable("duplicate key").is_retriable());
        assert!(!ConnectError::fatal_connection("no master").is_retriable());
        assert!(!ConnectError::routing("missing field").is_retriable());

        assert_eq!(
            ConnectError::fatal_connection("x").category(),
            ErrorCategory::FatalConnection
        );
        assert!(ErrorCategory::FatalConnection.is_task_fatal());
        assert!(!ErrorCategory::Transient.is_task_fatal());
        assert!(!ErrorCategory::Shutdown.is_task_fatal());
    }

    #[test]
    fn test_into_write_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = ConnectError::from(io).into_write_error();
        assert_eq!(err.category(), ErrorCategory::Transient);

        let err = ConnectError::routing("table gone").into_write_error();
        assert_eq!(err.category(), ErrorCategory::NonRetryable);

        let err = ConnectError::fatal_connection("down").into_write_error();
        assert_eq!(err.category(), ErrorCategory::FatalConnection);
    }
}

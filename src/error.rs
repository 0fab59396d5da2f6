//! Error types for the data-access layer.
//!
//! Engine faults (connection, database, timeout) are passed through from the
//! driver; the remaining variants describe misuse of the API or values that
//! cannot be projected onto a target type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("No data source registered for parameter type '{type_name}'")]
    UnsupportedSourceType { type_name: String },

    #[error(
        "Cannot convert {value_type} value '{value}' to {target} for field '{field}' of {owner}: {reason}"
    )]
    Coercion {
        field: String,
        owner: String,
        value: String,
        value_type: String,
        target: String,
        reason: String,
    },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Cannot access a disposed object: {object}")]
    ObjectDisposed { object: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Circuit breaker is open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Constructors take anything string-like.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// `sql_state` is the engine's SQLSTATE or error code when it reports one.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unsupported_source(type_name: impl Into<String>) -> Self {
        Self::UnsupportedSourceType {
            type_name: type_name.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn object_disposed(object: impl Into<String>) -> Self {
        Self::ObjectDisposed {
            object: object.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn circuit_open(retry_after_ms: u64) -> Self {
        Self::CircuitOpen { retry_after_ms }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is a transient engine fault worth retrying.
    ///
    /// Covers connectivity failures, errors reported by the engine itself and
    /// engine-side timeouts. API misuse, coercion failures, cancellation and an
    /// open circuit are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Database { .. } | Self::Timeout { .. }
        )
    }

    /// Check if this error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Driver faults keep their category; decode problems are internal.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;

        const RECONNECT: &str = "Reconnect to the database";
        let (message, suggestion) = match err {
            E::Database(db_err) => {
                return Self::database(
                    db_err.message(),
                    db_err.code().map(|c| c.into_owned()),
                    "Check the statement text and the objects it references",
                );
            }
            E::RowNotFound => {
                return Self::database(
                    "Statement returned no rows",
                    None,
                    "Verify the query conditions match existing data",
                );
            }
            E::TypeNotFound { type_name } => {
                return Self::database(
                    format!("Unknown engine type '{type_name}'"),
                    None,
                    "Check the column and parameter types",
                );
            }
            E::ColumnNotFound(column) => {
                return Self::database(
                    format!("No column named '{column}'"),
                    None,
                    "Check the selected column names",
                );
            }
            E::PoolTimedOut => return Self::timeout("pool acquire", 0),
            E::ColumnIndexOutOfBounds { index, len } => {
                return Self::internal(format!("Column {index} requested from a {len}-column row"));
            }
            E::ColumnDecode { index, source } => {
                return Self::internal(format!("Column {index} could not be decoded: {source}"));
            }
            E::Decode(source) => return Self::internal(format!("Decode failed: {source}")),

            E::Configuration(msg) => (
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            E::PoolClosed => ("Connection pool is closed".to_string(), RECONNECT),
            E::WorkerCrashed => ("Driver worker crashed".to_string(), RECONNECT),
            E::Io(e) => (
                format!("I/O error: {e}"),
                "Check network connectivity and that the server is running",
            ),
            E::Tls(e) => (
                format!("TLS error: {e}"),
                "Verify the TLS settings and certificates",
            ),
            E::Protocol(msg) => (
                format!("Protocol error: {msg}"),
                "Check that the server version is supported",
            ),
            other => return Self::internal(format!("Unexpected driver error: {other}")),
        };
        Self::connection(message, suggestion)
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

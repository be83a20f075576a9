// ABOUTME: Error taxonomy for table synchronization
// ABOUTME: Classifies PostgreSQL errors into recoverable schema drift and fatal kinds

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Errors raised by the synchronization engine.
///
/// Database errors are classified on conversion: `undefined_table` and
/// `undefined_column` become the two schema-drift kinds the copier recovers
/// from, every other database error stays [`SyncError::Database`].
#[derive(Error, Debug)]
pub enum SyncError {
    /// A referenced relation does not exist (SQLSTATE 42P01)
    #[error("Missing table: {0}")]
    TableMissing(String),

    /// A referenced column does not exist (SQLSTATE 42703)
    #[error("Missing column: {0}")]
    ColumnMissing(String),

    /// Two result columns share a name, so DDL cannot be inferred
    #[error("\"{0}\" used multiple times")]
    DuplicateField(String),

    /// The operation is not valid for the configured source
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Any other database error
    #[error("Database error: {0}")]
    Database(#[source] tokio_postgres::Error),

    /// Connection could not be established
    #[error("Connection error for {name}: {message}")]
    Connection { name: String, message: String },

    /// TLS connector could not be built
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Invalid link configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Create a Connection error
    pub fn connection(name: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Connection {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True for the two error kinds the copier recovers from locally.
    pub fn is_schema_drift(&self) -> bool {
        matches!(self, SyncError::TableMissing(_) | SyncError::ColumnMissing(_))
    }
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        let message = err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string());

        match err.code() {
            Some(code) if *code == SqlState::UNDEFINED_TABLE => SyncError::TableMissing(message),
            Some(code) if *code == SqlState::UNDEFINED_COLUMN => SyncError::ColumnMissing(message),
            _ => SyncError::Database(err),
        }
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

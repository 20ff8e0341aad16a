//! Error types for storage operations

use std::fmt;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug)]
pub enum StorageError {
    /// Database connection failed
    ConnectionFailed(String),

    /// Database query failed
    QueryFailed(String),

    /// Query returned no rows where one was required
    NotFound,

    /// Migration failed
    MigrationFailed(String),

    /// Host query predicate could not be parsed
    InvalidQuery(String),

    /// JSON column encode/decode error
    SerializationError(String),

    /// I/O error (file access, etc.)
    IoError(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ConnectionFailed(msg) => write!(f, "cannot open check store: {msg}"),
            StorageError::QueryFailed(msg) => write!(f, "check store query failed: {msg}"),
            StorageError::NotFound => f.write_str("record not found"),
            StorageError::MigrationFailed(msg) => write!(f, "schema migration failed: {msg}"),
            StorageError::InvalidQuery(msg) => write!(f, "invalid host query: {msg}"),
            StorageError::SerializationError(msg) => {
                write!(f, "malformed JSON column in check store: {msg}")
            }
            StorageError::IoError(err) => write!(f, "check store I/O error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let StorageError::IoError(err) = self {
            Some(err)
        } else {
            None
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Io(io) => Self::IoError(io),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::ConnectionFailed(err.to_string()),
            other => Self::QueryFailed(other.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationFailed(err.to_string())
    }
}

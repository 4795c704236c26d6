//! Error types for parley-core

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the parley-core library
#[derive(Error, Debug)]
pub enum Error {
    /// The database file (or its directory) could not be opened or configured
    #[error("failed to open database at {}: {source}", path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An operation was attempted before `connect()` or after `close()`
    #[error("database is not connected")]
    NotConnected,

    /// A statement failed to execute
    #[error("query failed: {source} (sql: {sql})")]
    Query {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A single migration failed; earlier migrations remain applied
    #[error("migration {version} failed: {source}")]
    MigrationFailed {
        version: String,
        #[source]
        source: Box<Error>,
    },

    /// The migration set on disk cannot be applied in a well-defined order
    #[error("invalid migration set: {0}")]
    InvalidMigration(String),

    /// Destructive operation refused by the current environment
    #[error("forbidden operation: {0}")]
    ForbiddenOperation(String),

    /// An update was requested without any mutable field
    #[error("no fields to update")]
    NoFieldsToUpdate,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Message not found
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// LLM provider error
    #[error(transparent)]
    Provider(#[from] crate::provider::ProviderError),
}

impl Error {
    /// Wraps an open failure together with the database location.
    pub(crate) fn connection(
        path: impl Into<PathBuf>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Wraps a driver error together with the statement that produced it.
    pub(crate) fn query(sql: &str, source: rusqlite::Error) -> Self {
        Error::Query {
            sql: sql.trim().to_string(),
            source,
        }
    }
}

/// Result type alias for parley-core
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for fastpg.

use thiserror::Error;

/// Boxed error raised by a driver collaborator.
///
/// The original error is kept intact so callers can downcast it
/// (for example to `sqlx::Error`) and inspect SQLSTATE codes.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for fastpg operations.
#[derive(Debug, Error)]
pub enum FastpgError {
    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `connect()` called on a database that is already connected.
    #[error("Database already connected")]
    AlreadyConnected,

    /// Operation attempted while the database is disconnected.
    #[error("Database is not connected")]
    NotConnected,

    /// `compile_many` called with no value sets.
    #[error("Batch values must contain at least one value set")]
    EmptyBatch,

    /// A batch value set lacks a key established by the first set.
    #[error("Missing key '{key}' in batch value set {index}")]
    MissingKey { key: String, index: usize },

    /// Positional column lookup past the end of a row.
    #[error("Column index {index} out of range for row with {len} columns")]
    ColumnIndex { index: usize, len: usize },

    /// Error surfaced by the driver, passed through unmodified.
    #[error(transparent)]
    Driver(DriverError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file.
    #[error("Invalid config file: {0}")]
    ConfigFile(#[from] toml::de::Error),
}

impl FastpgError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Borrow the driver error, if this is one.
    pub fn as_driver_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Self::Driver(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for FastpgError {
    fn from(e: sqlx::Error) -> Self {
        Self::Driver(Box::new(e))
    }
}

/// Result type alias for fastpg operations.
pub type FastpgResult<T> = Result<T, FastpgError>;

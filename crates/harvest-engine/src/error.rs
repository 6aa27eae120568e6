//! Engine error types

use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised by the ledger, queue and sink.
///
/// Fetch failures are never represented here: they are recorded on the work
/// item as data. Anything in this enum means the shared store or the caller's
/// input is unusable.
#[derive(Error, Debug)]
pub enum EngineError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid table prefix {0:?}: expected lowercase letters, digits and '_' (max 24 chars, starting with a letter)")]
    InvalidIdentifier(String),

    #[error("Run '{0}' not found in ledger")]
    RunNotFound(String),

    #[error("Run '{run_id}' is not resumable (status: {status})")]
    NotResumable { run_id: String, status: String },

    #[error("Run '{run_id}' cannot be finalized as '{status}'")]
    InvalidFinalStatus { run_id: String, status: String },

    #[error("Unknown {kind} value {value:?} in store")]
    UnknownValue { kind: &'static str, value: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownValue {
            kind,
            value: value.into(),
        }
    }
}

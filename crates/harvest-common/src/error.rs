//! Error types shared across Harvest crates

use thiserror::Error;

/// Result type alias for Harvest helper operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Error type for the shared helpers (logging, hashing, configuration parsing)
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl HarvestError {
    /// Configuration error for an environment variable that failed to parse
    pub fn invalid_env(name: &str, value: &str, expected: &str) -> Self {
        Self::Config(format!("{name}={value:?} is not a valid {expected}"))
    }
}

//! Error types for gpucell

use thiserror::Error;

/// Main error type for gpucell
#[derive(Error, Debug)]
pub enum GpucellError {
    /// Malformed topology or unreadable configuration file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovered cell does not match any configured GPU type or level
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// Release of a cell that is not currently allocated
    #[error("Release error: {0}")]
    Release(String),

    /// Internal inconsistency or a request naming an unknown type/level
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Malformed resource request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type for gpucell operations
pub type GpucellResult<T> = Result<T, GpucellError>;

impl From<toml::de::Error> for GpucellError {
    fn from(err: toml::de::Error) -> Self {
        GpucellError::Config(format!("Failed to parse config: {}", err))
    }
}

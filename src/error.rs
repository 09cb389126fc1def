//! Error types for the Tollgate service.

use thiserror::Error;

use crate::config::ValidationError;
use crate::store::StoreError;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration is missing, malformed, or fails validation.
    ///
    /// Fatal at startup: the process refuses to run with undefined thresholds.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The shared counter store could not be reached
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A stored behavior profile could not be decoded
    #[error("Corrupt profile for caller {caller}: {reason}")]
    ProfileCorrupt { caller: String, reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for TollgateError {
    fn from(err: ValidationError) -> Self {
        TollgateError::ConfigInvalid(err.to_string())
    }
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::ConfigInvalid(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

//! Error types for Tollgate.

use thiserror::Error;

use crate::ratelimit::BucketKey;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// No bucket has been created for the key
    #[error("No bucket exists for key {key}")]
    NotFound { key: BucketKey },

    /// Bucket parameters rejected at creation time
    #[error("Invalid bucket configuration: {0}")]
    InvalidConfiguration(String),

    /// Request cost that can never be debited
    #[error("Invalid cost {0}: must be finite and greater than zero")]
    InvalidCost(f64),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

//! Error types for the keyrate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for keyrate operations.
#[derive(Error, Debug)]
pub enum KeyrateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors that could not be recovered locally
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for keyrate operations.
pub type Result<T> = std::result::Result<T, KeyrateError>;

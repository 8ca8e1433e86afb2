//! Error types for the Ratewarden engine.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratewarden operations.
///
/// A rate-limit denial is never an error; it is reported through
/// [`RateLimitResult`](crate::ratelimit::RateLimitResult). These variants
/// cover bad configuration, contract violations and admin-path store failures.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller passed an empty or malformed identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The named rule is not registered
    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    /// Shared state store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

//! Common error types for Satchel.

use thiserror::Error;

/// Top-level error type for Satchel operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network transport failed (connection refused, DNS, TLS, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its bounded timeout.
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// The remote API answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Credentials were rejected by the remote API.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The remote API refused the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A remote response did not match the expected envelope.
    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation addressed a collection that is not configured.
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// The sync engine is shutting down or not running.
    #[error("Sync unavailable: {0}")]
    SyncUnavailable(String),
}

impl Error {
    /// Whether a retry can ever succeed for this error.
    ///
    /// Transient errors (unreachable network, timeouts, throttling, server
    /// faults) leave pending work in place for a later attempt. Everything
    /// else is permanent: retrying an invalid payload or a rejected token
    /// yields the same answer.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Api { status, .. } => {
                matches!(*status, 408 | 429) || (500..=599).contains(status)
            }
            Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

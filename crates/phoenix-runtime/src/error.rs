//! Error types for the runtime capabilities.

use thiserror::Error;

/// Errors that can occur when touching a persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing location cannot be resolved right now.
    #[error("store unavailable")]
    Unavailable,

    /// Artifact names must be a single plain path component.
    #[error("invalid artifact name: {0}")]
    InvalidName(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

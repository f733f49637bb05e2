//! Error types for network and time capabilities.

use thiserror::Error;

/// Errors reported by a [`crate::NetworkAdapter`] or [`crate::TimeSettings`].
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The process lacks the permission the operation needs.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The adapter or setting does not exist on this device.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The device refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

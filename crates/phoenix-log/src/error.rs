//! Error types for the diagnostic log.

use thiserror::Error;

/// Errors raised while writing to the file sink.
///
/// These never reach callers of [`crate::DiagnosticLog`]; the log degrades to
/// buffering instead. They surface from the rotation helpers and the worker.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("store error: {0}")]
    Store(#[from] phoenix_runtime::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start log worker: {0}")]
    Worker(std::io::Error),
}

//! Error types for schedule handling.

use thiserror::Error;

/// Errors that can occur while loading a schedule.
///
/// A malformed slot is never an error: it is skipped and reported as a
/// [`crate::ScheduleIssue`]. Only a document that cannot be read at all is.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The document is not valid JSON or not an object of weekday arrays.
    #[error("invalid schedule document: {0}")]
    Json(#[from] serde_json::Error),

    /// A slot time is not 24-hour `HH:MM`.
    #[error("invalid time of day {0:?}, expected HH:MM")]
    InvalidTime(String),

    /// A fixed offset zone name could not be parsed.
    #[error("invalid UTC offset {0:?}")]
    InvalidOffset(String),
}

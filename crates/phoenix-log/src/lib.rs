//! Diagnostic log for Phoenix.
//!
//! A [`DiagnosticLog`] keeps a capped ring of recent entries for live display,
//! mirrors every line to `tracing`, and writes to a rotating file sink when
//! one is attached. Without a sink it buffers lines and deferred artifact
//! writes in memory and replays them, in order, on the next attach.

mod config;
mod entry;
mod error;
mod log;
mod rotation;
mod sink;

pub use config::{LOG_FILE_NAME, LogConfig, RotationConfig};
pub use entry::LogEntry;
pub use error::SinkError;
pub use log::{DiagnosticLog, PendingCounts, SinkProbe};
pub use rotation::{backup_path, rotate};

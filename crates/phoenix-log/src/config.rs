//! Log configuration.

/// Name of the active log file inside the sink directory.
pub const LOG_FILE_NAME: &str = "phoenix.log";

/// Capacities of the in-memory structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Entries kept for live display.
    pub ring_capacity: usize,
    /// Lines buffered while no sink is attached. Oldest dropped past this.
    pub pending_line_limit: usize,
    /// Deferred artifact writes buffered while no sink is attached.
    pub pending_write_limit: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 100,
            pending_line_limit: 500,
            pending_write_limit: 200,
        }
    }
}

/// How the active log file is rotated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    /// Size the active file may not grow past.
    pub max_bytes: u64,
    /// Number of numbered backups kept.
    pub retention: usize,
    /// Gzip rotated backups.
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            retention: 3,
            compress: true,
        }
    }
}

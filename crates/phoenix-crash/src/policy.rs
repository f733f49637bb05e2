use std::time::Duration;

/// Restart throttling parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashPolicy {
    /// Trailing window in which crashes count against a restart.
    pub window: Duration,
    /// Restarts are refused once this many crashes fall inside the window.
    pub max_crashes: usize,
    /// Delay before the first restart; doubles with every recent crash.
    pub backoff_base: Duration,
}

impl CrashPolicy {
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Backoff for a given number of recent crashes: `base * 2^recent`,
    /// capped at the window.
    pub fn backoff_for(&self, recent: usize) -> Duration {
        let exponent = recent.min(30) as u32;
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.window)
    }
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 60),
            max_crashes: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

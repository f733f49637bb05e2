//! Timing knobs for a connection run.

use std::time::Duration;

use crate::Credentials;

/// Everything one [`crate::ConnectionEstablisher`] run needs.
///
/// Fields hold raw settings values; the accessor methods apply the floors
/// and clamps the run actually uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    pub credentials: Credentials,
    /// Zone name applied after connecting, where permitted.
    pub time_zone: String,
    /// Connection status polls before giving up.
    pub max_attempts: u32,
    /// Interval between connection status polls.
    pub attempt_delay: Duration,
    /// Configured settle time after turning the radio on.
    pub enable_delay: Duration,
    /// Delay between connecting and reporting time status.
    pub time_sync_delay: Duration,
    pub enable_base_wait: Duration,
    pub enable_max_multiplier: u32,
    pub enable_min_max_wait: Duration,
    pub state_poll_interval: Duration,
    /// Extra wait granted when the radio is still enabling at timeout.
    pub enabling_extra_grace: Duration,
    pub enabling_extra_poll: Duration,
    pub add_network_post_delay: Duration,
    pub add_network_max_attempts: u32,
    pub add_network_base_retry: Duration,
    pub add_network_max_retry: Duration,
    /// Drop the connection and its profile once time is synced.
    pub disconnect_after_sync: bool,
}

impl ConnectConfig {
    pub fn new(credentials: Credentials, time_zone: impl Into<String>) -> Self {
        Self {
            credentials,
            time_zone: time_zone.into(),
            max_attempts: 10,
            attempt_delay: Duration::from_millis(1000),
            enable_delay: Duration::from_millis(1500),
            time_sync_delay: Duration::from_millis(2000),
            enable_base_wait: Duration::from_millis(1500),
            enable_max_multiplier: 4,
            enable_min_max_wait: Duration::from_millis(3000),
            state_poll_interval: Duration::from_millis(500),
            enabling_extra_grace: Duration::from_millis(10_000),
            enabling_extra_poll: Duration::from_millis(1000),
            add_network_post_delay: Duration::from_millis(400),
            add_network_max_attempts: 6,
            add_network_base_retry: Duration::from_millis(400),
            add_network_max_retry: Duration::from_millis(3000),
            disconnect_after_sync: true,
        }
    }

    pub fn ssid(&self) -> &str {
        &self.credentials.ssid
    }

    /// Wait before the first radio state poll.
    pub fn initial_enable_wait(&self) -> Duration {
        self.enable_delay.max(self.enable_base_wait)
    }

    /// Total wait for the radio before the timeout path runs.
    pub fn max_enable_wait(&self) -> Duration {
        let multiplier = self.enable_max_multiplier.clamp(1, 10);
        self.initial_enable_wait()
            .saturating_mul(multiplier)
            .max(self.enable_min_max_wait)
    }

    /// Settle delay before the first add attempt.
    pub fn add_post_delay(&self) -> Duration {
        self.add_network_post_delay.max(self.enable_delay / 2)
    }

    pub fn add_attempts(&self) -> u32 {
        self.add_network_max_attempts.clamp(1, 20)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after failed add attempt `attempt` (1-based).
    pub fn add_retry_delay(&self, attempt: u32) -> Duration {
        retry_delay(
            self.add_network_base_retry,
            self.add_network_max_retry,
            attempt,
        )
    }
}

/// `base * 1.5^(attempt - 1)`, capped at `max`.
///
/// Computed in integer milliseconds as `base * 3^k / 2^k` so the sequence is
/// exact: 400, 600, 900, 1350, 2025, ...
pub fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let k = attempt.saturating_sub(1).min(40);
    let base_ms = base.as_millis();
    let scaled = base_ms.saturating_mul(3u128.pow(k)) / 2u128.pow(k);
    let ms = u64::try_from(scaled).unwrap_or(u64::MAX);
    Duration::from_millis(ms).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn config() -> ConnectConfig {
        ConnectConfig::new(Credentials::new("kiosk", "secret"), "Europe/Berlin")
    }

    #[test_case(1, 400 ; "first retry uses base")]
    #[test_case(2, 600 ; "second retry")]
    #[test_case(3, 900 ; "third retry")]
    #[test_case(4, 1350 ; "fourth retry")]
    #[test_case(5, 2025 ; "fifth retry")]
    #[test_case(6, 3000 ; "capped")]
    #[test_case(30, 3000 ; "far past cap")]
    fn test_add_retry_delay(attempt: u32, expected_ms: u64) {
        assert_eq!(
            config().add_retry_delay(attempt),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_enable_wait_bounds() {
        let mut config = config();
        assert_eq!(config.initial_enable_wait(), Duration::from_millis(1500));
        assert_eq!(config.max_enable_wait(), Duration::from_millis(6000));

        // Multiplier clamped to 10
        config.enable_max_multiplier = 50;
        assert_eq!(config.max_enable_wait(), Duration::from_millis(15_000));

        // Floor applies when the product is small
        config.enable_max_multiplier = 0;
        config.enable_delay = Duration::from_millis(100);
        config.enable_base_wait = Duration::from_millis(200);
        assert_eq!(config.max_enable_wait(), Duration::from_millis(3000));
    }

    #[test]
    fn test_add_post_delay_tracks_enable_delay() {
        let mut config = config();
        assert_eq!(config.add_post_delay(), Duration::from_millis(750));
        config.enable_delay = Duration::from_millis(200);
        assert_eq!(config.add_post_delay(), Duration::from_millis(400));
    }

    #[test]
    fn test_attempt_clamps() {
        let mut config = config();
        config.add_network_max_attempts = 0;
        config.max_attempts = 0;
        assert_eq!(config.add_attempts(), 1);
        assert_eq!(config.connect_attempts(), 1);

        config.add_network_max_attempts = 99;
        assert_eq!(config.add_attempts(), 20);
    }
}

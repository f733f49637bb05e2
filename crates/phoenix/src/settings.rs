//! The settings document.
//!
//! A single JSON file with `wifi`, `logging`, `crash` and `schedule`
//! sections plus a top-level `timeZone`. Every field is optional; missing
//! numbers take their defaults and out-of-range numbers are clamped by
//! [`Settings::normalize`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use phoenix_crash::CrashPolicy;
use phoenix_log::{LogConfig, RotationConfig};
use phoenix_net::{ConnectConfig, Credentials};
use phoenix_scheduler::{ScheduleDocument, ScheduleZone};

use crate::error::SettingsError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub wifi: WifiSettings,
    pub logging: LoggingSettings,
    pub crash: CrashSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WifiSettings {
    pub ssid: String,
    pub password: String,
    pub max_attempts: u32,
    pub attempt_delay_ms: u64,
    pub enable_delay_ms: u64,
    pub time_sync_delay_ms: u64,
    pub enable_base_wait_ms: u64,
    pub enable_max_multiplier: u32,
    pub enable_min_max_wait_ms: u64,
    pub state_poll_interval_ms: u64,
    pub enabling_extra_grace_ms: u64,
    pub enabling_extra_poll_ms: u64,
    pub add_network_post_delay_ms: u64,
    pub add_network_max_attempts: u32,
    pub add_network_base_retry_ms: u64,
    pub add_network_max_retry_ms: u64,
    pub disconnect_after_sync: bool,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            max_attempts: 10,
            attempt_delay_ms: 1000,
            enable_delay_ms: 1500,
            time_sync_delay_ms: 2000,
            enable_base_wait_ms: 1500,
            enable_max_multiplier: 4,
            enable_min_max_wait_ms: 3000,
            state_poll_interval_ms: 500,
            enabling_extra_grace_ms: 10_000,
            enabling_extra_poll_ms: 1000,
            add_network_post_delay_ms: 400,
            add_network_max_attempts: 6,
            add_network_base_retry_ms: 400,
            add_network_max_retry_ms: 3000,
            disconnect_after_sync: true,
        }
    }
}

impl WifiSettings {
    /// Connection run parameters, or `None` when no network is configured.
    pub fn connect_config(&self, time_zone: &str) -> Option<ConnectConfig> {
        let ssid = self.ssid.trim();
        if ssid.is_empty() {
            return None;
        }

        let ms = Duration::from_millis;
        let mut config =
            ConnectConfig::new(Credentials::new(ssid, self.password.clone()), time_zone);
        config.max_attempts = self.max_attempts;
        config.attempt_delay = ms(self.attempt_delay_ms);
        config.enable_delay = ms(self.enable_delay_ms);
        config.time_sync_delay = ms(self.time_sync_delay_ms);
        config.enable_base_wait = ms(self.enable_base_wait_ms);
        config.enable_max_multiplier = self.enable_max_multiplier;
        config.enable_min_max_wait = ms(self.enable_min_max_wait_ms);
        config.state_poll_interval = ms(self.state_poll_interval_ms);
        config.enabling_extra_grace = ms(self.enabling_extra_grace_ms);
        config.enabling_extra_poll = ms(self.enabling_extra_poll_ms);
        config.add_network_post_delay = ms(self.add_network_post_delay_ms);
        config.add_network_max_attempts = self.add_network_max_attempts;
        config.add_network_base_retry = ms(self.add_network_base_retry_ms);
        config.add_network_max_retry = ms(self.add_network_max_retry_ms);
        config.disconnect_after_sync = self.disconnect_after_sync;
        Some(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub rotation_size_bytes: u64,
    /// Lines kept in memory while no log sink is attached.
    pub buffer_lines: usize,
    pub rotation_retention: usize,
    pub rotation_compress: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        let rotation = RotationConfig::default();
        Self {
            rotation_size_bytes: rotation.max_bytes,
            buffer_lines: LogConfig::default().pending_line_limit,
            rotation_retention: rotation.retention,
            rotation_compress: rotation.compress,
        }
    }
}

impl LoggingSettings {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            pending_line_limit: self.buffer_lines,
            ..LogConfig::default()
        }
    }

    pub fn rotation(&self) -> RotationConfig {
        RotationConfig {
            max_bytes: self.rotation_size_bytes,
            retention: self.rotation_retention,
            compress: self.rotation_compress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrashSettings {
    pub window_ms: u64,
    pub max_count: usize,
    pub backoff_base_ms: u64,
}

impl Default for CrashSettings {
    fn default() -> Self {
        Self {
            window_ms: 30 * 60 * 1000,
            max_count: 3,
            backoff_base_ms: 2000,
        }
    }
}

impl CrashSettings {
    pub fn policy(&self) -> CrashPolicy {
        CrashPolicy {
            window: Duration::from_millis(self.window_ms),
            max_crashes: self.max_count,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
        }
    }
}

const MIN_ROTATION_BYTES: u64 = 64 * 1024;
const MIN_POLL_MS: u64 = 10;

impl Settings {
    /// Read and normalize the settings file at `path`.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SettingsError> {
        let mut settings: Settings = serde_json::from_str(text)?;
        settings.normalize();
        Ok(settings)
    }

    /// Clamp numeric knobs into the ranges the subsystems accept.
    pub fn normalize(&mut self) {
        let wifi = &mut self.wifi;
        wifi.max_attempts = wifi.max_attempts.max(1);
        wifi.enable_max_multiplier = wifi.enable_max_multiplier.clamp(1, 10);
        wifi.add_network_max_attempts = wifi.add_network_max_attempts.clamp(1, 20);
        wifi.state_poll_interval_ms = wifi.state_poll_interval_ms.max(MIN_POLL_MS);
        wifi.enabling_extra_poll_ms = wifi.enabling_extra_poll_ms.max(MIN_POLL_MS);
        wifi.attempt_delay_ms = wifi.attempt_delay_ms.max(MIN_POLL_MS);
        wifi.add_network_max_retry_ms = wifi
            .add_network_max_retry_ms
            .max(wifi.add_network_base_retry_ms);

        let logging = &mut self.logging;
        logging.rotation_size_bytes = logging.rotation_size_bytes.max(MIN_ROTATION_BYTES);
        logging.buffer_lines = logging.buffer_lines.max(1);

        self.crash.max_count = self.crash.max_count.max(1);
        self.crash.window_ms = self.crash.window_ms.max(1);
    }

    /// Zone the schedule is read in.
    pub fn zone(&self) -> ScheduleZone {
        ScheduleZone::from_name(self.time_zone.as_deref())
    }

    pub fn connect_config(&self) -> Option<ConnectConfig> {
        self.wifi
            .connect_config(self.time_zone.as_deref().unwrap_or_default())
    }

    /// Settings as pretty JSON with the password masked.
    pub fn redacted_json(&self) -> Result<String, SettingsError> {
        let mut copy = self.clone();
        if !copy.wifi.password.is_empty() {
            copy.wifi.password = "****".to_string();
        }
        Ok(serde_json::to_string_pretty(&copy)?)
    }
}

//! Capabilities the establisher drives: the radio, device time settings, and
//! whoever displays progress.

use std::fmt;
use std::net::IpAddr;

use crate::AdapterError;

/// Power state of the wireless radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Disabling,
    Disabled,
    Enabling,
    Enabled,
    Unknown,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RadioState::Disabling => "DISABLING",
            RadioState::Disabled => "DISABLED",
            RadioState::Enabling => "ENABLING",
            RadioState::Enabled => "ENABLED",
            RadioState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Network name and passphrase.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl Credentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identifier of a stored credential profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProfileId(pub u32);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the radio is currently associated with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ssid: Option<String>,
    pub ip_address: Option<IpAddr>,
}

impl ConnectionInfo {
    /// Associated with `ssid` and holding an address.
    pub fn is_connected_to(&self, ssid: &str) -> bool {
        self.ssid.as_deref() == Some(ssid) && self.ip_address.is_some()
    }
}

/// The wireless adapter.
pub trait NetworkAdapter: Send + Sync {
    fn radio_state(&self) -> RadioState;

    fn set_radio_enabled(&self, enabled: bool) -> Result<(), AdapterError>;

    /// Whether the process may change radio power and stored profiles.
    fn can_change_radio(&self) -> bool;

    /// Remove every stored profile for `ssid`. Returns how many were removed.
    fn remove_profiles(&self, ssid: &str) -> Result<usize, AdapterError>;

    fn add_profile(&self, credentials: &Credentials) -> Result<ProfileId, AdapterError>;

    /// Select a stored profile and (re)connect to it.
    fn activate_profile(&self, id: ProfileId) -> Result<(), AdapterError>;

    fn connection_info(&self) -> ConnectionInfo;

    fn disconnect(&self) -> Result<(), AdapterError>;
}

/// Device time settings.
pub trait TimeSettings: Send + Sync {
    /// Whether the device keeps its clock in sync automatically.
    fn auto_time_enabled(&self) -> Result<bool, AdapterError>;

    fn auto_time_zone_enabled(&self) -> Result<bool, AdapterError>;

    /// Apply a time zone by name. Fails with
    /// [`AdapterError::PermissionDenied`] where that is not allowed.
    fn set_time_zone(&self, zone: &str) -> Result<(), AdapterError>;
}

/// Receives human-readable progress.
pub trait StatusListener: Send + Sync {
    fn on_network_status(&self, ssid: &str, status: &str);

    fn on_time_status(&self, auto_synced: bool, zone: &str);
}

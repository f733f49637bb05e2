//! Adapters for a host whose networking and clock the OS manages.
//!
//! The daemon does not own the radio or the system time zone on a general
//! purpose host. These adapters report what they can observe and refuse
//! every change with [`AdapterError::PermissionDenied`], which sends the
//! establisher down its best-effort paths.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;

use tracing::debug;

use phoenix_net::{
    AdapterError, ConnectionInfo, Credentials, NetworkAdapter, ProfileId, RadioState,
    TimeSettings,
};

/// Address used to learn the outbound interface. Nothing is sent.
const PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(192, 0, 2, 1), 9);

/// Marker systemd-timesyncd creates once the clock has been synchronized.
const TIMESYNC_MARKER: &str = "/run/systemd/timesync/synchronized";

/// Networking owned by the host OS.
#[derive(Debug, Clone)]
pub struct HostNetwork {
    ssid: String,
}

impl HostNetwork {
    /// `ssid` is reported as the associated network whenever the host has
    /// a route out.
    pub fn new(ssid: impl Into<String>) -> Self {
        Self { ssid: ssid.into() }
    }

    fn outbound_address() -> Option<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket.connect(PROBE_ADDR).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_unspecified()).then_some(ip)
    }
}

impl NetworkAdapter for HostNetwork {
    fn radio_state(&self) -> RadioState {
        RadioState::Enabled
    }

    fn set_radio_enabled(&self, _enabled: bool) -> Result<(), AdapterError> {
        Err(AdapterError::PermissionDenied(
            "radio power is managed by the host".to_string(),
        ))
    }

    fn can_change_radio(&self) -> bool {
        false
    }

    fn remove_profiles(&self, _ssid: &str) -> Result<usize, AdapterError> {
        Ok(0)
    }

    fn add_profile(&self, credentials: &Credentials) -> Result<ProfileId, AdapterError> {
        debug!(ssid = %credentials.ssid, "host manages network profiles, nothing to add");
        Ok(ProfileId(0))
    }

    fn activate_profile(&self, _id: ProfileId) -> Result<(), AdapterError> {
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        match Self::outbound_address() {
            Some(ip) => ConnectionInfo {
                ssid: Some(self.ssid.clone()),
                ip_address: Some(ip),
            },
            None => ConnectionInfo::default(),
        }
    }

    fn disconnect(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Clock settings owned by the host OS.
#[derive(Debug, Clone)]
pub struct HostTime {
    sync_marker: PathBuf,
}

impl HostTime {
    pub fn new() -> Self {
        Self::with_marker(TIMESYNC_MARKER)
    }

    pub fn with_marker(marker: impl Into<PathBuf>) -> Self {
        Self {
            sync_marker: marker.into(),
        }
    }
}

impl Default for HostTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSettings for HostTime {
    fn auto_time_enabled(&self) -> Result<bool, AdapterError> {
        Ok(self.sync_marker.exists())
    }

    fn auto_time_zone_enabled(&self) -> Result<bool, AdapterError> {
        Ok(false)
    }

    fn set_time_zone(&self, zone: &str) -> Result<(), AdapterError> {
        Err(AdapterError::PermissionDenied(format!(
            "time zone {zone} must be set on the host"
        )))
    }
}

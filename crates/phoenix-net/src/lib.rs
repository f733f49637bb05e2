//! Network join and time sync for Phoenix.
//!
//! [`ConnectionEstablisher`] turns the radio on, registers the configured
//! credentials, waits for the connection and performs a time sync handshake.
//! Every wait is a bounded poll on the [`phoenix_runtime::TimerScheduler`],
//! so the completion callback always fires.

mod adapter;
mod config;
mod error;
mod establisher;

pub use adapter::{
    ConnectionInfo, Credentials, NetworkAdapter, ProfileId, RadioState, StatusListener,
    TimeSettings,
};
pub use config::{ConnectConfig, retry_delay};
pub use error::AdapterError;
pub use establisher::{
    Completion, ConnectOutcome, ConnectState, ConnectionEstablisher, FailureReason,
    STATUS_CONNECTED, STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_FAILED, STATUS_WAITING,
};

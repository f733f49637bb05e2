//! Capabilities shared by the Phoenix subsystems.
//!
//! Every subsystem consumes the outside world through the traits in this
//! crate so that storage, wall time and timers can be absent, slow or
//! simulated:
//! - [`WallClock`] for the current instant
//! - [`PersistentStore`] for small named text artifacts
//! - [`TimerScheduler`] for cooperative callbacks on a single dispatch context

mod clock;
mod dispatch;
mod error;
mod manual;
mod store;

pub use clock::{ManualClock, SystemClock, WallClock};
pub use dispatch::{
    DispatchLoop, Dispatcher, FailureHook, Task, TimerHandle, TimerScheduler, panic_message,
};
pub use error::StoreError;
pub use manual::{ManualTimers, PostedTimer};
pub use store::{DirStore, PersistentStore, WriteMode};

//! Crash governor for Phoenix.
//!
//! Keeps a durable list of crash timestamps and decides whether, and after
//! how long, the controller may restart itself. Recording never fails: while
//! storage is missing the history is buffered in memory and replayed in
//! chronological order once it returns.

mod governor;
pub mod history;
mod policy;

pub use governor::{CrashGovernor, LAST_CRASH_FILE, MAX_PENDING_CRASHES, Migration};
pub use history::HISTORY_FILE;
pub use policy::CrashPolicy;

//! Weekly ON/OFF schedule for Phoenix.
//!
//! This crate provides:
//! - The weekly schedule model and its JSON document form
//! - Pure functions deciding whether the device is ON and what flips next
//! - [`TimeWindowScheduler`], which keeps exactly one wake alarm armed

mod error;
mod scheduler;
mod types;
pub mod window;

pub use error::ScheduleError;
pub use scheduler::{ScheduleOutcome, TimeWindowScheduler, TransitionListener};
pub use types::{
    LoadedSchedule, SCHEDULE_STATE_FILE, ScheduleDocument, ScheduleIssue, ScheduleState,
    ScheduleZone, SlotDocument, TimeSlot, Transition, TransitionKind, WeeklySchedule,
    parse_slot_time,
};
pub use window::{choose_next, is_currently_on, next_on, upcoming_transitions};

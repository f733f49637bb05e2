//! Read-only views for the `preview`, `state` and `crashes` commands.

use std::fmt::Write as _;

use chrono::{DateTime, TimeZone, Utc};

use phoenix_crash::CrashGovernor;
use phoenix_scheduler::{
    ScheduleZone, WeeklySchedule, choose_next, is_currently_on, next_on, upcoming_transitions,
    window::TRANSITION_HORIZON_DAYS,
};

use crate::settings::Settings;

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

fn schedule_of(settings: &Settings, out: &mut String) -> WeeklySchedule {
    let Some(document) = &settings.schedule else {
        return WeeklySchedule::new();
    };
    let loaded = WeeklySchedule::from_document(document);
    for issue in &loaded.issues {
        let _ = writeln!(out, "skipped {issue}");
    }
    loaded.schedule
}

/// Upcoming transitions from `at` and the alarm the daemon would arm.
pub fn preview(settings: &Settings, at: DateTime<Utc>, count: usize) -> String {
    let mut out = String::new();
    let schedule = schedule_of(settings, &mut out);
    let zone = settings.zone();

    let on = is_currently_on(&schedule, at, &zone);
    let _ = writeln!(out, "zone: {zone}");
    let _ = writeln!(out, "now:  {} ({})", zone.format(at), on_off(on));

    if schedule.is_empty() {
        let _ = writeln!(out, "schedule is empty: always ON");
        return out;
    }

    let upcoming = upcoming_transitions(&schedule, at, &zone, TRANSITION_HORIZON_DAYS);
    let _ = writeln!(out, "upcoming:");
    for transition in upcoming.iter().take(count) {
        let _ = writeln!(
            out,
            "  {:<3} {}",
            transition.kind.to_string(),
            zone.format(transition.at)
        );
    }

    match choose_next(on, &upcoming) {
        Some(next) => {
            let _ = writeln!(out, "alarm: {} at {}", next.kind, zone.format(next.at));
        }
        None => {
            let _ = writeln!(out, "alarm: none within {TRANSITION_HORIZON_DAYS} days");
        }
    }
    if let Some(next) = next_on(&schedule, at, &zone) {
        let _ = writeln!(out, "next ON: {}", zone.format(next));
    }
    out
}

/// `ON` or `OFF` for `at`.
pub fn state(settings: &Settings, at: DateTime<Utc>) -> String {
    let mut ignored = String::new();
    let schedule = schedule_of(settings, &mut ignored);
    on_off(is_currently_on(&schedule, at, &settings.zone())).to_string()
}

/// Crash history and the restart verdict.
pub fn crashes(governor: &CrashGovernor, zone: &ScheduleZone) -> String {
    let mut out = String::new();
    let history = governor.history();
    let policy = governor.policy();

    let _ = writeln!(out, "crashes recorded: {}", history.len());
    for timestamp in &history {
        match Utc.timestamp_millis_opt(*timestamp).single() {
            Some(at) => {
                let _ = writeln!(out, "  {}", zone.format(at));
            }
            None => {
                let _ = writeln!(out, "  {timestamp} (out of range)");
            }
        }
    }

    let _ = writeln!(
        out,
        "within last {} s: {} of {}",
        policy.window.as_secs(),
        governor.recent_count(),
        policy.max_crashes
    );
    match governor.next_restart_delay() {
        Some(delay) => {
            let _ = writeln!(out, "restart allowed after {} ms", delay.as_millis());
        }
        None => {
            let _ = writeln!(out, "restarts exhausted");
        }
    }
    out
}

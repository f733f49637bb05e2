//! Pure ON/OFF computations over a weekly schedule.
//!
//! Nothing here touches a clock or a timer; every function takes `now`
//! explicitly and can be recomputed at will.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use crate::{ScheduleZone, TimeSlot, Transition, TransitionKind, WeeklySchedule};

/// Days scanned when choosing the next alarm.
pub const TRANSITION_HORIZON_DAYS: u32 = 14;

/// Days scanned when looking for the next ON.
pub const NEXT_ON_HORIZON_DAYS: u32 = 8;

/// Whether the schedule says the device should be ON at `now`.
///
/// Today's and yesterday's slots are examined, so windows that wrap past
/// midnight are honoured. A slot with only `on` holds from `on` onwards.
/// An empty schedule means always ON.
pub fn is_currently_on(schedule: &WeeklySchedule, now: DateTime<Utc>, zone: &ScheduleZone) -> bool {
    if schedule.is_empty() {
        return true;
    }

    let today = zone.local_date(now);
    [today.pred_opt(), Some(today)]
        .into_iter()
        .flatten()
        .any(|date| {
            schedule
                .slots(date.weekday())
                .iter()
                .any(|slot| slot_covers(slot, date, now, zone))
        })
}

fn slot_covers(slot: &TimeSlot, date: NaiveDate, now: DateTime<Utc>, zone: &ScheduleZone) -> bool {
    let Some(on) = slot.on.and_then(|on| zone.resolve(date, on)) else {
        return false;
    };
    match slot.off {
        Some(_) => match off_instant(slot, date, zone) {
            Some(off) => on <= now && now < off,
            None => false,
        },
        None => now >= on,
    }
}

/// Off boundary of `slot` when it starts on `date`.
fn off_instant(slot: &TimeSlot, date: NaiveDate, zone: &ScheduleZone) -> Option<DateTime<Utc>> {
    let off = slot.off?;
    let date = if slot.off_rolls_over() {
        date.checked_add_days(Days::new(1))?
    } else {
        date
    };
    zone.resolve(date, off)
}

/// Every ON and OFF boundary strictly after `now`, ascending.
///
/// Walks `horizon_days` calendar days starting today. Yesterday's slots are
/// included too, because an overnight window that started yesterday still
/// owes today its OFF.
pub fn upcoming_transitions(
    schedule: &WeeklySchedule,
    now: DateTime<Utc>,
    zone: &ScheduleZone,
    horizon_days: u32,
) -> Vec<Transition> {
    let today = zone.local_date(now);
    let mut transitions = Vec::new();

    let first = today.pred_opt().unwrap_or(today);
    for date in first.iter_days().take(horizon_days as usize + 1) {
        for slot in schedule.slots(date.weekday()) {
            let on = slot.on.and_then(|on| zone.resolve(date, on));
            let off = off_instant(slot, date, zone);
            // A daylight-saving shift can leave the window empty
            if matches!((on, off), (Some(on), Some(off)) if off <= on) {
                continue;
            }
            if let Some(at) = on {
                transitions.push(Transition {
                    at,
                    kind: TransitionKind::On,
                });
            }
            if let Some(at) = off {
                transitions.push(Transition {
                    at,
                    kind: TransitionKind::Off,
                });
            }
        }
    }

    transitions.retain(|t| t.at > now);
    transitions.sort_by_key(|t| t.at);
    transitions
}

/// The first transition that flips `currently_on`.
///
/// When nothing within the list flips the state, the earliest transition is
/// chosen anyway, even though it only re-confirms the current state.
pub fn choose_next(currently_on: bool, upcoming: &[Transition]) -> Option<Transition> {
    upcoming
        .iter()
        .find(|t| t.kind.is_on() != currently_on)
        .or_else(|| upcoming.first())
        .copied()
}

/// The next ON boundary within [`NEXT_ON_HORIZON_DAYS`].
pub fn next_on(
    schedule: &WeeklySchedule,
    now: DateTime<Utc>,
    zone: &ScheduleZone,
) -> Option<DateTime<Utc>> {
    upcoming_transitions(schedule, now, zone, NEXT_ON_HORIZON_DAYS)
        .into_iter()
        .find(|t| t.kind.is_on())
        .map(|t| t.at)
}

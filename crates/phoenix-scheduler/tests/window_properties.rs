//! Property tests for the schedule window functions.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use proptest::prelude::*;

use phoenix_scheduler::{
    ScheduleZone, TimeSlot, WeeklySchedule, choose_next, is_currently_on, upcoming_transitions,
};

const DAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn time_of_day() -> impl Strategy<Value = NaiveTime> {
    (0u32..24, 0u32..60).prop_map(|(h, m)| NaiveTime::from_hms_opt(h, m, 0).unwrap())
}

/// Slots with both boundaries, up to three per day.
fn schedule() -> impl Strategy<Value = WeeklySchedule> {
    prop::collection::vec(
        prop::collection::vec((time_of_day(), time_of_day()), 0..3),
        7,
    )
    .prop_map(|days| {
        let mut schedule = WeeklySchedule::new();
        for (day, slots) in DAYS.into_iter().zip(days) {
            for (on, off) in slots {
                schedule.push(day, TimeSlot::window(on, off));
            }
        }
        schedule
    })
}

fn zone() -> impl Strategy<Value = ScheduleZone> {
    prop_oneof![
        Just(ScheduleZone::Utc),
        (-48i32..=56).prop_map(|quarters| {
            ScheduleZone::Fixed(FixedOffset::east_opt(quarters * 15 * 60).unwrap())
        }),
        // Zones with daylight saving, including a half-hour shift
        prop::sample::select(vec!["America/New_York", "Europe/Berlin", "Australia/Lord_Howe"])
            .prop_map(|name| ScheduleZone::from_name(Some(name))),
    ]
}

fn instant() -> impl Strategy<Value = DateTime<Utc>> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0i64..366 * 24 * 3600).prop_map(move |secs| base + Duration::seconds(secs))
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 512, ..ProptestConfig::default() })]

    /// Between two instants with no listed boundary in `(t1, t2]` the
    /// ON/OFF answer does not change.
    #[test]
    fn prop_state_changes_only_at_listed_boundaries(
        schedule in schedule(),
        zone in zone(),
        t1 in instant(),
        delta_secs in 1i64..12 * 24 * 3600,
    ) {
        let t2 = t1 + Duration::seconds(delta_secs);
        let upcoming = upcoming_transitions(&schedule, t1, &zone, 14);
        let crossed = upcoming.iter().any(|t| t.at > t1 && t.at <= t2);

        if !crossed {
            prop_assert_eq!(
                is_currently_on(&schedule, t1, &zone),
                is_currently_on(&schedule, t2, &zone),
                "state changed between {} and {} without a boundary", t1, t2
            );
        }
    }

    #[test]
    fn prop_upcoming_sorted_and_future(
        schedule in schedule(),
        zone in zone(),
        now in instant(),
    ) {
        let upcoming = upcoming_transitions(&schedule, now, &zone, 14);
        prop_assert!(upcoming.iter().all(|t| t.at > now));
        prop_assert!(upcoming.windows(2).all(|w| w[0].at <= w[1].at));
    }

    /// The chosen alarm flips the state whenever any listed boundary does.
    #[test]
    fn prop_chosen_alarm_prefers_a_flip(
        schedule in schedule(),
        zone in zone(),
        now in instant(),
    ) {
        let upcoming = upcoming_transitions(&schedule, now, &zone, 14);
        let on = is_currently_on(&schedule, now, &zone);

        match choose_next(on, &upcoming) {
            None => prop_assert!(upcoming.is_empty()),
            Some(chosen) => {
                let any_flip = upcoming.iter().any(|t| t.kind.is_on() != on);
                prop_assert_eq!(chosen.kind.is_on() != on, any_flip);
                if !any_flip {
                    prop_assert_eq!(chosen, upcoming[0]);
                }
            }
        }
    }

    /// An ON boundary is inclusive: the state reads ON at that instant.
    #[test]
    fn prop_on_boundary_is_inclusive(
        schedule in schedule(),
        zone in zone(),
        now in instant(),
    ) {
        let upcoming = upcoming_transitions(&schedule, now, &zone, 14);
        for t in upcoming.iter().filter(|t| t.kind.is_on()) {
            prop_assert!(
                is_currently_on(&schedule, t.at, &zone),
                "ON boundary at {} reads OFF", t.at
            );
        }
    }
}

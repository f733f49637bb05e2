//! Single-alarm scheduler over a weekly ON/OFF schedule.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use phoenix_log::DiagnosticLog;
use phoenix_runtime::{
    PersistentStore, StoreError, TimerHandle, TimerScheduler, WallClock, WriteMode,
};

use crate::window::{self, TRANSITION_HORIZON_DAYS};
use crate::{
    SCHEDULE_STATE_FILE, ScheduleDocument, ScheduleState, ScheduleZone, Transition,
    TransitionKind, WeeklySchedule,
};

/// Receives schedule flips as they fire.
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, kind: TransitionKind);
}

/// What [`TimeWindowScheduler::schedule_next`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A new alarm was armed, replacing any previous one.
    Armed(Transition),
    /// The same alarm is already armed; nothing changed.
    AlreadyArmed(Transition),
    /// Nothing lies ahead within the horizon; no alarm is armed.
    NoTransitions,
}

#[derive(Clone)]
struct Plan {
    schedule: Arc<WeeklySchedule>,
    zone: ScheduleZone,
}

struct Armed {
    transition: Transition,
    handle: TimerHandle,
}

struct State {
    plan: Option<Plan>,
    armed: Option<Armed>,
    generation: u64,
    /// Last state written, used while the store cannot be read.
    remembered: ScheduleState,
}

struct Inner {
    timers: Arc<dyn TimerScheduler>,
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn WallClock>,
    log: Arc<DiagnosticLog>,
    listener: Mutex<Option<Arc<dyn TransitionListener>>>,
    state: Mutex<State>,
    me: Weak<Inner>,
}

/// Keeps exactly one wake alarm armed for the next ON/OFF flip.
///
/// Each fired alarm persists the new state, notifies the listener and arms
/// the following flip, so the chain never holds more than one outstanding
/// timer.
pub struct TimeWindowScheduler {
    inner: Arc<Inner>,
}

impl TimeWindowScheduler {
    /// Create a scheduler. Nothing is armed until [`Self::schedule_next`].
    pub fn new(
        timers: Arc<dyn TimerScheduler>,
        store: Arc<dyn PersistentStore>,
        clock: Arc<dyn WallClock>,
        log: Arc<DiagnosticLog>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            timers,
            store,
            clock,
            log,
            listener: Mutex::new(None),
            state: Mutex::new(State {
                plan: None,
                armed: None,
                generation: 0,
                remembered: ScheduleState::default(),
            }),
            me: me.clone(),
        });
        Self { inner }
    }

    pub fn set_listener(&self, listener: Arc<dyn TransitionListener>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Build a schedule from its document, logging every skipped slot.
    pub fn load(&self, document: &ScheduleDocument) -> WeeklySchedule {
        let loaded = WeeklySchedule::from_document(document);
        for issue in &loaded.issues {
            warn!(%issue, "skipping schedule entry");
            self.inner.log.add_log(format!("Schedule parse error: {issue}"));
        }
        loaded.schedule
    }

    /// Arm the alarm for the next flip of `schedule`.
    ///
    /// Calling again with an unchanged schedule and instant is a no-op.
    pub fn schedule_next(&self, schedule: Arc<WeeklySchedule>, zone: ScheduleZone) -> ScheduleOutcome {
        let now = self.inner.clock.now();
        self.inner.schedule_next(Plan { schedule, zone }, now)
    }

    /// Deliver a flip to the listener, then arm the following one.
    ///
    /// Returns `None` when no schedule has been given yet.
    pub fn on_transition_fired(&self, kind: TransitionKind) -> Option<ScheduleOutcome> {
        let now = self.inner.clock.now();
        self.inner.on_transition_fired(kind, now)
    }

    /// Cancel the armed alarm and forget the schedule.
    pub fn stop(&self) {
        let mut state = self.inner.lock_state();
        state.plan = None;
        state.generation += 1;
        if let Some(armed) = state.armed.take() {
            self.inner.timers.cancel(armed.handle);
            info!("cancelled schedule alarm");
            self.inner.log.add_log("Schedule: canceled scheduled alarm");
        }
    }

    /// Whether the device should be ON now.
    ///
    /// Without a schedule this is the state set by the last fired
    /// transition, or ON if none ever fired.
    pub fn current_state(&self) -> bool {
        let plan = self.inner.lock_state().plan.clone();
        match plan {
            Some(plan) => window::is_currently_on(&plan.schedule, self.inner.clock.now(), &plan.zone),
            None => self.last_known_state().unwrap_or(true),
        }
    }

    /// State persisted by the last fired transition.
    pub fn last_known_state(&self) -> Option<bool> {
        let state = self.inner.lock_state();
        self.inner.read_state(&state.remembered).currently_on
    }

    /// The transition the armed alarm will deliver.
    pub fn armed(&self) -> Option<Transition> {
        self.inner
            .lock_state()
            .armed
            .as_ref()
            .map(|armed| armed.transition)
    }

    /// Next ON boundary of the current schedule within eight days.
    pub fn next_on_epoch(&self) -> Option<DateTime<Utc>> {
        let plan = self.inner.lock_state().plan.clone()?;
        window::next_on(&plan.schedule, self.inner.clock.now(), &plan.zone)
    }
}

impl Drop for TimeWindowScheduler {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if let Some(armed) = state.armed.take() {
            self.inner.timers.cancel(armed.handle);
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm the first flip strictly after `now`.
    fn schedule_next(&self, plan: Plan, now: DateTime<Utc>) -> ScheduleOutcome {
        let mut state = self.lock_state();

        let upcoming =
            window::upcoming_transitions(&plan.schedule, now, &plan.zone, TRANSITION_HORIZON_DAYS);
        let currently_on = window::is_currently_on(&plan.schedule, now, &plan.zone);
        let zone = plan.zone;
        state.plan = Some(plan);

        let Some(chosen) = window::choose_next(currently_on, &upcoming) else {
            self.log.add_log("Schedule: no upcoming transitions found");
            if let Some(armed) = state.armed.take() {
                self.timers.cancel(armed.handle);
            }
            return ScheduleOutcome::NoTransitions;
        };

        if chosen.kind.is_on() == currently_on {
            warn!(kind = %chosen.kind, "no state change within horizon, arming first transition");
            self.log.add_log(format!(
                "Schedule: no state change within {TRANSITION_HORIZON_DAYS} days; arming first transition"
            ));
        }

        let epoch = chosen.epoch_millis();
        let persisted = self.read_state(&state.remembered);
        let live = state
            .armed
            .as_ref()
            .is_some_and(|armed| armed.transition == chosen);
        if persisted.next_scheduled_at == Some(epoch) && live {
            debug!(epoch, "schedule alarm already armed");
            self.log.add_log(format!(
                "Schedule: next scheduled epoch already set to {} - skipping duplicate",
                zone.format(chosen.at)
            ));
            return ScheduleOutcome::AlreadyArmed(chosen);
        }

        if let Some(armed) = state.armed.take() {
            self.timers.cancel(armed.handle);
        }
        state.generation += 1;
        let handle = self.arm(state.generation, chosen);
        state.armed = Some(Armed {
            transition: chosen,
            handle,
        });
        self.write_state(&mut state, |s| s.next_scheduled_at = Some(epoch));

        info!(kind = %chosen.kind, at = %chosen.at, "armed schedule alarm");
        self.log.add_log(format!(
            "Schedule: scheduled {} at {}",
            chosen.kind,
            zone.format(chosen.at)
        ));
        ScheduleOutcome::Armed(chosen)
    }

    fn arm(&self, generation: u64, transition: Transition) -> TimerHandle {
        let me = self.me.clone();
        self.timers.post_at(
            transition.at,
            Box::new(move || {
                if let Some(inner) = me.upgrade() {
                    inner.on_alarm(generation, transition);
                }
            }),
        )
    }

    fn on_alarm(&self, generation: u64, transition: Transition) {
        {
            let mut state = self.lock_state();
            if state.generation != generation || state.armed.is_none() {
                debug!(generation, "ignoring stale schedule alarm");
                return;
            }
            state.armed = None;
        }

        self.log.add_log(format!(
            "Schedule alarm fired: turnOn={} scheduledAt={}",
            transition.kind.is_on(),
            transition.at.to_rfc3339()
        ));
        // The wall clock may read behind the alarm after a step back; the
        // fired transition must not be chosen again.
        let now = self.clock.now().max(transition.at);
        self.on_transition_fired(transition.kind, now);
    }

    fn on_transition_fired(
        &self,
        kind: TransitionKind,
        now: DateTime<Utc>,
    ) -> Option<ScheduleOutcome> {
        let plan = {
            let mut state = self.lock_state();
            self.write_state(&mut state, |s| s.currently_on = Some(kind.is_on()));
            state.plan.clone()
        };

        info!(%kind, "schedule transition");
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener.on_transition(kind);
        }

        plan.map(|plan| self.schedule_next(plan, now))
    }

    fn read_state(&self, remembered: &ScheduleState) -> ScheduleState {
        match self.store.read(SCHEDULE_STATE_FILE) {
            Ok(Some(text)) => ScheduleState::parse(&text),
            Ok(None) | Err(StoreError::Unavailable) => *remembered,
            Err(e) => {
                warn!(error = %e, "failed to read schedule state");
                *remembered
            }
        }
    }

    fn write_state(&self, state: &mut State, update: impl FnOnce(&mut ScheduleState)) {
        let mut next = self.read_state(&state.remembered);
        update(&mut next);
        state.remembered = next;

        match self
            .store
            .write(SCHEDULE_STATE_FILE, &next.render(), WriteMode::Overwrite)
        {
            Ok(()) => {}
            Err(StoreError::Unavailable) => debug!("schedule state kept in memory"),
            Err(e) => {
                warn!(error = %e, "failed to persist schedule state");
                self.log
                    .add_log(format!("Failed to persist schedule state: {e}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Weekday};
    use phoenix_log::LogConfig;
    use phoenix_runtime::{DirStore, ManualClock, ManualTimers};
    use pretty_assertions::assert_eq;

    use crate::TimeSlot;

    #[derive(Default)]
    struct Recorder {
        kinds: Mutex<Vec<TransitionKind>>,
    }

    impl TransitionListener for Recorder {
        fn on_transition(&self, kind: TransitionKind) {
            self.kinds.lock().unwrap().push(kind);
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<DirStore>,
        timers: Arc<ManualTimers>,
        log: Arc<DiagnosticLog>,
        recorder: Arc<Recorder>,
        scheduler: TimeWindowScheduler,
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, h, m, 0).unwrap()
    }

    fn weekdays() -> Arc<WeeklySchedule> {
        let slot = TimeSlot::window(hm(8, 0), hm(18, 0));
        Arc::new(
            [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
                .into_iter()
                .fold(WeeklySchedule::new(), |s, day| s.with_slot(day, slot)),
        )
    }

    impl Fixture {
        fn new(now: DateTime<Utc>) -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let store = Arc::new(DirStore::new(tmp.path()));
            Self::with_store(tmp, store, now)
        }

        fn with_store(tmp: tempfile::TempDir, store: Arc<DirStore>, now: DateTime<Utc>) -> Self {
            let clock = Arc::new(ManualClock::new(now));
            let timers = Arc::new(ManualTimers::new(Arc::clone(&clock)));
            let log = Arc::new(DiagnosticLog::new(LogConfig::default()).unwrap());
            let scheduler = TimeWindowScheduler::new(
                Arc::clone(&timers) as Arc<dyn TimerScheduler>,
                Arc::clone(&store) as Arc<dyn PersistentStore>,
                clock,
                Arc::clone(&log),
            );
            let recorder = Arc::new(Recorder::default());
            scheduler.set_listener(Arc::clone(&recorder) as Arc<dyn TransitionListener>);
            Self {
                _tmp: tmp,
                store,
                timers,
                log,
                recorder,
                scheduler,
            }
        }

        fn persisted(&self) -> ScheduleState {
            ScheduleState::parse(
                &self
                    .store
                    .read(SCHEDULE_STATE_FILE)
                    .unwrap()
                    .unwrap_or_default(),
            )
        }
    }

    #[test]
    fn test_arms_next_flip_and_persists_epoch() {
        // Monday 19:00, after hours
        let f = Fixture::new(at(3, 19, 0));

        let outcome = f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        let expected = Transition {
            at: at(4, 8, 0),
            kind: TransitionKind::On,
        };
        assert_eq!(outcome, ScheduleOutcome::Armed(expected));
        assert_eq!(f.scheduler.armed(), Some(expected));
        assert_eq!(f.timers.pending(), 1);
        assert_eq!(f.timers.next_due(), Some(expected.at));
        assert_eq!(f.persisted().next_scheduled_at, Some(expected.epoch_millis()));
        assert!(!f.scheduler.current_state());
    }

    #[test]
    fn test_schedule_next_twice_arms_once() {
        let f = Fixture::new(at(3, 10, 0));

        let first = f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);
        let second = f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        let ScheduleOutcome::Armed(transition) = first else {
            panic!("expected an armed alarm, got {first:?}");
        };
        assert_eq!(second, ScheduleOutcome::AlreadyArmed(transition));
        assert_eq!(f.timers.posted().len(), 1);
        assert_eq!(f.timers.pending(), 1);
        assert!(
            f.log
                .entries()
                .iter()
                .any(|e| e.message.contains("skipping duplicate"))
        );
    }

    #[test]
    fn test_new_instance_rearms_despite_persisted_epoch() {
        let first = Fixture::new(at(3, 10, 0));
        first.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);
        let Fixture { _tmp, store, .. } = first;

        // Same store, fresh process: the old alarm is gone with it
        let second = Fixture::with_store(_tmp, store, at(3, 10, 0));
        let outcome = second.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        assert!(matches!(outcome, ScheduleOutcome::Armed(_)));
        assert_eq!(second.timers.pending(), 1);
    }

    #[test]
    fn test_fired_alarm_notifies_and_rearms() {
        let f = Fixture::new(at(3, 10, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        assert!(f.timers.fire_next());

        assert_eq!(*f.recorder.kinds.lock().unwrap(), vec![TransitionKind::Off]);
        assert_eq!(f.persisted().currently_on, Some(false));
        assert_eq!(
            f.scheduler.armed(),
            Some(Transition {
                at: at(4, 8, 0),
                kind: TransitionKind::On,
            })
        );
        assert_eq!(f.timers.pending(), 1);
    }

    #[test]
    fn test_chain_keeps_exactly_one_alarm() {
        let f = Fixture::new(at(3, 10, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        // Monday 18:00 through Friday 18:00
        for _ in 0..9 {
            assert_eq!(f.timers.pending(), 1);
            assert!(f.timers.fire_next());
        }
        assert_eq!(f.timers.pending(), 1);

        // A working week alternates OFF, ON, ... and skips the weekend
        let kinds = f.recorder.kinds.lock().unwrap().clone();
        assert!(kinds.windows(2).all(|w| w[0] != w[1]), "{kinds:?}");
        assert_eq!(kinds[0], TransitionKind::Off);
        assert_eq!(
            f.scheduler.armed().map(|t| t.at),
            Some(at(11, 8, 0)),
            "weekend is skipped"
        );
    }

    #[test]
    fn test_alarm_with_clock_behind_fires_once() {
        let f = Fixture::new(at(3, 10, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        // Each alarm runs while the wall clock still reads 5 ms early
        for _ in 0..3 {
            assert!(f.timers.fire_next_skewed(chrono::Duration::milliseconds(-5)));
        }

        assert_eq!(
            *f.recorder.kinds.lock().unwrap(),
            vec![TransitionKind::Off, TransitionKind::On, TransitionKind::Off]
        );
        assert_eq!(
            f.scheduler.armed(),
            Some(Transition {
                at: at(5, 8, 0),
                kind: TransitionKind::On,
            })
        );
        assert_eq!(f.timers.pending(), 1);
    }

    #[test]
    fn test_stop_cancels_and_falls_back_to_last_fired_state() {
        let f = Fixture::new(at(3, 10, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);
        f.timers.fire_next();

        f.scheduler.stop();

        assert_eq!(f.timers.pending(), 0);
        assert_eq!(f.scheduler.armed(), None);
        assert_eq!(f.scheduler.last_known_state(), Some(false));
        assert!(!f.scheduler.current_state());
        assert_eq!(f.scheduler.next_on_epoch(), None);
        assert_eq!(f.scheduler.on_transition_fired(TransitionKind::On), None);
        assert_eq!(f.timers.pending(), 0);
    }

    #[test]
    fn test_schedule_change_replaces_alarm() {
        let f = Fixture::new(at(3, 10, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        let late = Arc::new(
            WeeklySchedule::new().with_slot(Weekday::Mon, TimeSlot::window(hm(8, 0), hm(20, 0))),
        );
        let outcome = f.scheduler.schedule_next(late, ScheduleZone::Utc);

        assert_eq!(
            outcome,
            ScheduleOutcome::Armed(Transition {
                at: at(3, 20, 0),
                kind: TransitionKind::Off,
            })
        );
        assert_eq!(f.timers.pending(), 1);
        assert_eq!(f.timers.posted().len(), 2);
    }

    #[test]
    fn test_empty_schedule_disarms() {
        let f = Fixture::new(at(3, 10, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        let outcome = f
            .scheduler
            .schedule_next(Arc::new(WeeklySchedule::new()), ScheduleZone::Utc);

        assert_eq!(outcome, ScheduleOutcome::NoTransitions);
        assert_eq!(f.timers.pending(), 0);
        assert!(f.scheduler.current_state());
    }

    #[test]
    fn test_unavailable_store_keeps_bookkeeping_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(DirStore::new(tmp.path().join("missing")));
        let f = Fixture::with_store(tmp, store, at(3, 10, 0));

        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);
        let second = f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        assert!(matches!(second, ScheduleOutcome::AlreadyArmed(_)));
        assert_eq!(f.timers.posted().len(), 1);

        f.timers.fire_next();
        assert_eq!(f.scheduler.last_known_state(), Some(false));
    }

    #[test]
    fn test_next_on_epoch() {
        let f = Fixture::new(at(7, 19, 0));
        f.scheduler.schedule_next(weekdays(), ScheduleZone::Utc);

        // Friday evening: next ON is Monday morning
        assert_eq!(f.scheduler.next_on_epoch(), Some(at(10, 8, 0)));
    }

    #[test]
    fn test_load_logs_skipped_slots() {
        let f = Fixture::new(at(3, 10, 0));
        let document: ScheduleDocument =
            serde_json::from_str(r#"{"monday": [{"on": "8 o'clock"}, {"on": "08:00", "off": "18:00"}]}"#)
                .unwrap();

        let schedule = f.scheduler.load(&document);

        assert_eq!(schedule.slots(Weekday::Mon).len(), 1);
        assert!(
            f.log
                .entries()
                .iter()
                .any(|e| e.message.starts_with("Schedule parse error: monday[0]"))
        );
    }
}

//! Deterministic timers driven through virtual time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::dispatch::{Task, TimerHandle, TimerScheduler};
use crate::{ManualClock, WallClock};

/// Record of one posted callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedTimer {
    pub handle: TimerHandle,
    /// Virtual time at which it was posted.
    pub posted_at: DateTime<Utc>,
    /// Virtual time at which it becomes due.
    pub due: DateTime<Utc>,
}

impl PostedTimer {
    /// How far ahead of posting the callback was scheduled.
    pub fn delay(&self) -> Duration {
        (self.due - self.posted_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    queue: BTreeMap<(DateTime<Utc>, u64), Task>,
    due_by_id: HashMap<u64, DateTime<Utc>>,
    posted: Vec<PostedTimer>,
}

/// A [`TimerScheduler`] that only fires when asked.
///
/// Firing a callback moves the shared [`ManualClock`] forward to its due
/// instant first, so code under test sees time pass exactly as scheduled.
/// Callbacks run on the calling thread, in due order, ties broken by post
/// order.
pub struct ManualTimers {
    clock: Arc<ManualClock>,
    state: Mutex<ManualState>,
}

impl ManualTimers {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(ManualState::default()),
        }
    }

    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Due instant of the next callback.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().queue.keys().next().map(|(due, _)| *due)
    }

    /// Every callback posted so far, cancelled or not, in post order.
    pub fn posted(&self) -> Vec<PostedTimer> {
        self.lock().posted.clone()
    }

    /// Fire the earliest pending callback. Returns false if none was pending.
    pub fn fire_next(&self) -> bool {
        match self.pop_next() {
            Some((due, task)) => {
                if due > self.clock.now() {
                    self.clock.set(due);
                }
                task();
                true
            }
            None => false,
        }
    }

    /// Fire the earliest pending callback with the clock reading `skew`
    /// relative to its due instant, as after the wall clock was stepped.
    pub fn fire_next_skewed(&self, skew: chrono::Duration) -> bool {
        match self.pop_next() {
            Some((due, task)) => {
                self.clock.set(due + skew);
                task();
                true
            }
            None => false,
        }
    }

    // The lock must be released before running the task: tasks post and
    // cancel timers themselves.
    fn pop_next(&self) -> Option<(DateTime<Utc>, Task)> {
        let mut state = self.lock();
        let ((due, id), task) = state.queue.pop_first()?;
        state.due_by_id.remove(&id);
        Some((due, task))
    }

    /// Fire callbacks until none are pending or `max_steps` have run.
    /// Returns the number fired.
    pub fn run_until_idle(&self, max_steps: usize) -> usize {
        let mut fired = 0;
        while fired < max_steps && self.fire_next() {
            fired += 1;
        }
        fired
    }

    /// Move virtual time forward by `by`, firing everything that falls due.
    /// Returns the number fired.
    pub fn advance(&self, by: chrono::Duration) -> usize {
        let target = self.clock.now() + by;
        let mut fired = 0;
        while self.next_due().is_some_and(|due| due <= target) {
            self.fire_next();
            fired += 1;
        }
        if target > self.clock.now() {
            self.clock.set(target);
        }
        fired
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(&self, due: DateTime<Utc>, task: Task) -> TimerHandle {
        let posted_at = self.clock.now();
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        let handle = TimerHandle::new(id);

        state.queue.insert((due, id), task);
        state.due_by_id.insert(id, due);
        state.posted.push(PostedTimer {
            handle,
            posted_at,
            due,
        });
        handle
    }
}

impl TimerScheduler for ManualTimers {
    fn post_at(&self, at: DateTime<Utc>, task: Task) -> TimerHandle {
        self.schedule(at, task)
    }

    fn post_after(&self, delay: Duration, task: Task) -> TimerHandle {
        let now = self.clock.now();
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule(due, task)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        let mut state = self.lock();
        match state.due_by_id.remove(&handle.id()) {
            Some(due) => state.queue.remove(&(due, handle.id())).is_some(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Task {
        let log = Arc::clone(log);
        Box::new(move || log.lock().unwrap().push(name))
    }

    #[test]
    fn test_fires_in_due_order_and_moves_clock() {
        let clock = Arc::new(ManualClock::new(start()));
        let timers = ManualTimers::new(Arc::clone(&clock));
        let log = Arc::new(Mutex::new(Vec::new()));

        timers.post_after(Duration::from_secs(30), recorder(&log, "b"));
        timers.post_after(Duration::from_secs(10), recorder(&log, "a"));
        timers.post_after(Duration::from_secs(30), recorder(&log, "c"));
        assert_eq!(timers.pending(), 3);

        assert!(timers.fire_next());
        assert_eq!(clock.now(), start() + chrono::Duration::seconds(10));

        assert_eq!(timers.run_until_idle(10), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(clock.now(), start() + chrono::Duration::seconds(30));
        assert!(!timers.fire_next());
    }

    #[test]
    fn test_cancel_removes_callback() {
        let clock = Arc::new(ManualClock::new(start()));
        let timers = ManualTimers::new(clock);
        let log = Arc::new(Mutex::new(Vec::new()));

        let handle = timers.post_after(Duration::from_secs(1), recorder(&log, "x"));
        assert!(timers.cancel(handle));
        assert!(!timers.cancel(handle));
        assert_eq!(timers.pending(), 0);
        assert_eq!(timers.run_until_idle(10), 0);
        assert!(log.lock().unwrap().is_empty());
        // The post is still on record
        assert_eq!(timers.posted().len(), 1);
    }

    #[test]
    fn test_advance_fires_only_due_callbacks() {
        let clock = Arc::new(ManualClock::new(start()));
        let timers = ManualTimers::new(Arc::clone(&clock));
        let log = Arc::new(Mutex::new(Vec::new()));

        timers.post_at(start() + chrono::Duration::minutes(5), recorder(&log, "soon"));
        timers.post_at(start() + chrono::Duration::hours(5), recorder(&log, "later"));

        assert_eq!(timers.advance(chrono::Duration::minutes(10)), 1);
        assert_eq!(*log.lock().unwrap(), vec!["soon"]);
        assert_eq!(clock.now(), start() + chrono::Duration::minutes(10));
        assert_eq!(timers.pending(), 1);
    }

    #[test]
    fn test_posted_records_delays() {
        let clock = Arc::new(ManualClock::new(start()));
        let timers = ManualTimers::new(clock);

        timers.post_after(Duration::from_millis(400), Box::new(|| {}));
        timers.post_after(Duration::from_millis(600), Box::new(|| {}));

        let delays: Vec<_> = timers.posted().iter().map(PostedTimer::delay).collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(400), Duration::from_millis(600)]
        );
    }
}

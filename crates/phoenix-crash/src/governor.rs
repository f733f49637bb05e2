//! Restart throttling over a durable crash history.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use phoenix_log::DiagnosticLog;
use phoenix_runtime::{PersistentStore, StoreError, WallClock, WriteMode};
use tracing::{debug, info, warn};

use crate::history::{self, HISTORY_FILE};
use crate::CrashPolicy;

/// Artifact holding details of the most recent fatal error.
pub const LAST_CRASH_FILE: &str = "last_crash.txt";

/// Crash timestamps buffered while the store is unavailable. Oldest dropped
/// past this.
pub const MAX_PENDING_CRASHES: usize = 1000;

/// What [`CrashGovernor::migrate_to`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// The history already lives at the target.
    AlreadyThere,
    /// Entries were merged into the target and the fallback artifact removed.
    Moved { entries: usize },
    /// The target could not be written yet; entries wait in memory and the
    /// fallback artifact is kept.
    Deferred { entries: usize },
}

struct Inner {
    store: Arc<dyn PersistentStore>,
    /// Crashes not yet appended to the store, oldest first.
    pending: VecDeque<i64>,
}

impl Inner {
    fn push_pending(&mut self, timestamp: i64) {
        while self.pending.len() >= MAX_PENDING_CRASHES {
            self.pending.pop_front();
            warn!(
                max = MAX_PENDING_CRASHES,
                "pending crash buffer full, dropping oldest"
            );
        }
        self.pending.push_back(timestamp);
    }

    /// Append buffered crashes to the store. Returns whether the store is
    /// usable and holds everything.
    fn flush(&mut self) -> bool {
        if !self.store.is_available() {
            return false;
        }
        if self.pending.is_empty() {
            return true;
        }

        let entries: Vec<i64> = self.pending.iter().copied().collect();
        match self
            .store
            .write(HISTORY_FILE, &history::render(&entries), WriteMode::Append)
        {
            Ok(()) => {
                debug!(count = entries.len(), "flushed pending crash records");
                self.pending.clear();
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to flush crash records, keeping them buffered");
                false
            }
        }
    }

    fn durable(&self) -> Vec<i64> {
        read_history(self.store.as_ref()).unwrap_or_else(|e| {
            if !matches!(e, StoreError::Unavailable) {
                warn!(error = %e, "failed to read crash history");
            }
            Vec::new()
        })
    }
}

fn read_history(store: &dyn PersistentStore) -> Result<Vec<i64>, StoreError> {
    Ok(store
        .read(HISTORY_FILE)?
        .map(|text| history::parse(&text))
        .unwrap_or_default())
}

/// Decides whether the controller may restart after a crash.
pub struct CrashGovernor {
    policy: CrashPolicy,
    clock: Arc<dyn WallClock>,
    log: Arc<DiagnosticLog>,
    inner: Mutex<Inner>,
}

impl CrashGovernor {
    pub fn new(
        policy: CrashPolicy,
        store: Arc<dyn PersistentStore>,
        clock: Arc<dyn WallClock>,
        log: Arc<DiagnosticLog>,
    ) -> Self {
        Self {
            policy,
            clock,
            log,
            inner: Mutex::new(Inner {
                store,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn policy(&self) -> &CrashPolicy {
        &self.policy
    }

    /// Append a crash at `timestamp` (epoch ms), then drop entries that have
    /// left the window.
    pub fn record_and_prune(&self, timestamp: i64) {
        let cutoff = self.cutoff();
        let mut inner = self.lock();
        inner.push_pending(timestamp);

        if !inner.flush() {
            inner.pending.retain(|&t| t >= cutoff);
            info!(
                timestamp,
                buffered = inner.pending.len(),
                "crash store unavailable, buffering crash record"
            );
            self.log
                .add_pending_file_log(format!("Crash recorded while storage unavailable: {timestamp}"));
            return;
        }

        let entries = inner.durable();
        let mut kept: Vec<i64> = entries.iter().copied().filter(|&t| t >= cutoff).collect();
        kept.sort_unstable();
        if kept != entries {
            let rendered = history::render(&kept);
            if let Err(e) = inner
                .store
                .write(HISTORY_FILE, &rendered, WriteMode::Overwrite)
            {
                warn!(error = %e, "failed to prune crash history");
            }
        }
        debug!(timestamp, recent = kept.len(), "recorded crash");
    }

    /// Push buffered crashes to the store if it has become available.
    /// Returns true when nothing is left in memory.
    pub fn flush_pending(&self) -> bool {
        let mut inner = self.lock();
        inner.flush() && inner.pending.is_empty()
    }

    /// Every known crash, durable and buffered, oldest first.
    pub fn history(&self) -> Vec<i64> {
        let inner = self.lock();
        let pending: Vec<i64> = inner.pending.iter().copied().collect();
        history::merge_chronological(&inner.durable(), &pending)
    }

    /// Number of crashes inside the trailing window.
    pub fn recent_count(&self) -> usize {
        let cutoff = self.cutoff();
        self.history().into_iter().filter(|&t| t >= cutoff).count()
    }

    pub fn should_restart(&self) -> bool {
        self.recent_count() < self.policy.max_crashes
    }

    /// Delay before the next restart, or `None` when restarts are exhausted.
    pub fn next_restart_delay(&self) -> Option<Duration> {
        let recent = self.recent_count();
        if recent >= self.policy.max_crashes {
            return None;
        }
        Some(self.policy.backoff_for(recent))
    }

    /// Move the history into `target`, merging with whatever it already holds.
    pub fn migrate_to(&self, target: Arc<dyn PersistentStore>) -> Migration {
        let mut inner = self.lock();

        if inner.store.same_location(target.as_ref()) {
            inner.store = target;
            return Migration::AlreadyThere;
        }

        let old = inner.durable();
        let fallback = Arc::clone(&inner.store);
        inner.store = target;

        if inner.store.is_available() {
            let pending: Vec<i64> = inner.pending.iter().copied().collect();
            let existing = inner.durable();
            let mut merged =
                history::merge_chronological(&history::merge_chronological(&existing, &old), &pending);
            merged.dedup();

            match inner
                .store
                .write(HISTORY_FILE, &history::render(&merged), WriteMode::Overwrite)
            {
                Ok(()) => {
                    inner.pending.clear();
                    if fallback.exists(HISTORY_FILE) {
                        if let Err(e) = fallback.remove(HISTORY_FILE) {
                            warn!(error = %e, "failed to remove fallback crash history");
                        }
                    }
                    info!(entries = old.len(), "migrated crash history");
                    return Migration::Moved { entries: old.len() };
                }
                Err(e) => {
                    warn!(error = %e, "failed to write migrated crash history");
                }
            }
        }

        // Buffer the old entries ahead of anything newer
        let pending: Vec<i64> = inner.pending.drain(..).collect();
        for t in history::merge_chronological(&old, &pending) {
            inner.push_pending(t);
        }
        info!(entries = old.len(), "crash history migration deferred");
        Migration::Deferred { entries: old.len() }
    }

    /// Leave a trace of an unrecoverable error for the next boot.
    pub fn report_fatal(&self, details: &str) {
        let now = self.clock.now_millis();
        self.log.add_pending_file_log(format!("[FATAL] {details}"));
        self.log.write_deferred_file(
            LAST_CRASH_FILE,
            &format!("timestamp={now}\n{details}\n"),
            WriteMode::Overwrite,
        );
    }

    fn cutoff(&self) -> i64 {
        self.clock
            .now_millis()
            .saturating_sub(self.policy.window_ms())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use phoenix_log::{LogConfig, RotationConfig};
    use phoenix_runtime::{DirStore, ManualClock};
    use pretty_assertions::assert_eq;
    use std::fs;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: std::path::PathBuf,
        clock: Arc<ManualClock>,
        log: Arc<DiagnosticLog>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            ));
            let log = Arc::new(DiagnosticLog::new(LogConfig::default()).unwrap());
            Self {
                _tmp: tmp,
                root,
                clock,
                log,
            }
        }

        fn store(&self, name: &str) -> Arc<DirStore> {
            Arc::new(DirStore::create(self.root.join(name)).unwrap())
        }

        fn missing_store(&self, name: &str) -> Arc<DirStore> {
            Arc::new(DirStore::new(self.root.join(name)))
        }

        fn governor(&self, policy: CrashPolicy, store: Arc<dyn PersistentStore>) -> CrashGovernor {
            CrashGovernor::new(
                policy,
                store,
                Arc::clone(&self.clock) as Arc<dyn WallClock>,
                Arc::clone(&self.log),
            )
        }

        fn now(&self) -> i64 {
            self.clock.now_millis()
        }
    }

    fn minute_policy() -> CrashPolicy {
        CrashPolicy {
            window: Duration::from_millis(60_000),
            max_crashes: 3,
            backoff_base: Duration::from_millis(2000),
        }
    }

    #[test]
    fn test_restart_refused_from_third_crash() {
        let fx = Fixture::new();
        let governor = fx.governor(minute_policy(), fx.store("card"));
        let now = fx.now();

        governor.record_and_prune(now);
        assert!(governor.should_restart());
        governor.record_and_prune(now + 3);
        assert!(governor.should_restart());

        governor.record_and_prune(now + 6);
        assert!(!governor.should_restart());
        assert_eq!(governor.next_restart_delay(), None);

        governor.record_and_prune(now + 9);
        assert!(!governor.should_restart());
        assert_eq!(governor.next_restart_delay(), None);
        assert_eq!(governor.recent_count(), 4);
    }

    #[test]
    fn test_backoff_follows_recent_count() {
        let fx = Fixture::new();
        let governor = fx.governor(
            CrashPolicy {
                max_crashes: 10,
                ..minute_policy()
            },
            fx.store("card"),
        );

        assert_eq!(governor.next_restart_delay(), Some(Duration::from_millis(2000)));
        governor.record_and_prune(fx.now());
        assert_eq!(governor.next_restart_delay(), Some(Duration::from_millis(4000)));
        governor.record_and_prune(fx.now());
        assert_eq!(governor.next_restart_delay(), Some(Duration::from_millis(8000)));
        for _ in 0..5 {
            governor.record_and_prune(fx.now());
        }
        // 2000 * 2^7 is past the window
        assert_eq!(governor.next_restart_delay(), Some(Duration::from_millis(60_000)));
    }

    #[test]
    fn test_prune_drops_entries_outside_window() {
        let fx = Fixture::new();
        let store = fx.store("card");
        let now = fx.now();
        fs::write(
            store.path().join(HISTORY_FILE),
            format!("{}\ngarbage\n{}\n", now - 120_000, now - 30_000),
        )
        .unwrap();
        let governor = fx.governor(minute_policy(), store.clone());

        assert_eq!(governor.recent_count(), 1);
        governor.record_and_prune(now);

        assert_eq!(
            fs::read_to_string(store.path().join(HISTORY_FILE)).unwrap(),
            format!("{}\n{}\n", now - 30_000, now)
        );
        assert_eq!(governor.recent_count(), 2);
    }

    #[test]
    fn test_window_slides_with_clock() {
        let fx = Fixture::new();
        let governor = fx.governor(minute_policy(), fx.store("card"));
        for _ in 0..3 {
            governor.record_and_prune(fx.now());
        }
        assert!(!governor.should_restart());

        fx.clock.advance(chrono::Duration::milliseconds(60_001));
        assert_eq!(governor.recent_count(), 0);
        assert!(governor.should_restart());
    }

    #[test]
    fn test_buffers_while_unavailable_then_flushes_in_order() {
        let fx = Fixture::new();
        let store = fx.missing_store("card");
        let governor = fx.governor(minute_policy(), store.clone());
        let now = fx.now();

        governor.record_and_prune(now);
        governor.record_and_prune(now + 1);
        assert_eq!(governor.recent_count(), 2);
        assert_eq!(governor.history(), vec![now, now + 1]);

        fs::create_dir_all(store.path()).unwrap();
        governor.record_and_prune(now + 2);

        assert_eq!(
            fs::read_to_string(store.path().join(HISTORY_FILE)).unwrap(),
            format!("{now}\n{}\n{}\n", now + 1, now + 2)
        );
        assert!(governor.flush_pending());
    }

    #[test]
    fn test_pending_pruned_while_unavailable() {
        let fx = Fixture::new();
        let governor = fx.governor(minute_policy(), fx.missing_store("card"));
        let now = fx.now();

        governor.record_and_prune(now - 90_000);
        governor.record_and_prune(now);
        assert_eq!(governor.history(), vec![now]);
    }

    #[test]
    fn test_migrate_merges_and_removes_fallback() {
        let fx = Fixture::new();
        let fallback = fx.store("internal");
        let card = fx.store("card");
        let now = fx.now();
        fs::write(card.path().join(HISTORY_FILE), format!("{}\n", now - 10)).unwrap();

        let governor = fx.governor(minute_policy(), fallback.clone());
        governor.record_and_prune(now - 20);
        governor.record_and_prune(now);

        assert_eq!(governor.migrate_to(card.clone()), Migration::Moved { entries: 2 });
        assert!(!fallback.path().join(HISTORY_FILE).exists());
        assert_eq!(
            fs::read_to_string(card.path().join(HISTORY_FILE)).unwrap(),
            format!("{}\n{}\n{now}\n", now - 20, now - 10)
        );

        // Later crashes land in the new location
        governor.record_and_prune(now + 1);
        assert_eq!(governor.recent_count(), 4);
        assert!(!fallback.path().join(HISTORY_FILE).exists());
    }

    #[test]
    fn test_migrate_to_same_location_is_noop() {
        let fx = Fixture::new();
        let store = fx.store("card");
        let governor = fx.governor(minute_policy(), store.clone());
        governor.record_and_prune(fx.now());

        let again = Arc::new(DirStore::new(store.path()));
        assert_eq!(governor.migrate_to(again), Migration::AlreadyThere);
        assert_eq!(governor.recent_count(), 1);
    }

    #[test]
    fn test_migrate_to_unavailable_target_defers() {
        let fx = Fixture::new();
        let fallback = fx.store("internal");
        let card = fx.missing_store("card");
        let now = fx.now();

        let governor = fx.governor(minute_policy(), fallback.clone());
        governor.record_and_prune(now);

        assert_eq!(governor.migrate_to(card.clone()), Migration::Deferred { entries: 1 });
        // Fallback kept until the move can complete
        assert!(fallback.path().join(HISTORY_FILE).exists());
        assert_eq!(governor.recent_count(), 1);

        fs::create_dir_all(card.path()).unwrap();
        assert!(governor.flush_pending());
        assert_eq!(
            fs::read_to_string(card.path().join(HISTORY_FILE)).unwrap(),
            format!("{now}\n")
        );
    }

    #[test]
    fn test_report_fatal_writes_last_crash() {
        let fx = Fixture::new();
        let governor = fx.governor(minute_policy(), fx.store("card"));
        let sink = fx.root.join("logs");

        governor.report_fatal("thread 'main' panicked at boom");
        fx.log.attach_sink(&sink, RotationConfig::default());
        fx.log.flush();

        let last = fs::read_to_string(sink.join(LAST_CRASH_FILE)).unwrap();
        assert_eq!(
            last,
            format!("timestamp={}\nthread 'main' panicked at boom\n", fx.now())
        );
        let log = fs::read_to_string(sink.join(phoenix_log::LOG_FILE_NAME)).unwrap();
        assert!(log.contains("[FATAL] thread 'main' panicked at boom"));
    }
}

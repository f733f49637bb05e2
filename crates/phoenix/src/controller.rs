//! Wiring between storage, the network join, the schedule and crash recovery.
//!
//! Every method here runs on the dispatch context: lifecycle events are posted
//! by the daemon, and subsystem callbacks arrive as posted timers.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{debug, info, warn};

use phoenix_crash::{CrashGovernor, Migration};
use phoenix_log::DiagnosticLog;
use phoenix_net::{
    ConnectOutcome, ConnectionEstablisher, NetworkAdapter, StatusListener, TimeSettings,
};
use phoenix_runtime::{PersistentStore, TimerHandle, TimerScheduler, WallClock, WriteMode};
use phoenix_scheduler::{
    ScheduleOutcome, ScheduleZone, TimeWindowScheduler, TransitionKind, TransitionListener,
    WeeklySchedule,
};

use crate::settings::Settings;

/// Artifact holding the settings the controller started with.
pub const SETTINGS_SNAPSHOT_FILE: &str = "settings_snapshot.json";

/// Something the display side should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// Show or blank the display.
    Display(bool),
    NetworkStatus { ssid: String, status: String },
    TimeStatus { auto_synced: bool, zone: String },
    RestartScheduled(Duration),
    RestartsExhausted,
}

/// Forwards subsystem callbacks onto the event channel.
///
/// Holding only the sender keeps the subsystems from owning the controller.
#[derive(Clone)]
pub struct EventForwarder(Sender<ControllerEvent>);

impl EventForwarder {
    pub fn new(events: Sender<ControllerEvent>) -> Self {
        Self(events)
    }

    fn send(&self, event: ControllerEvent) {
        if self.0.send(event).is_err() {
            debug!("event receiver gone, dropping controller event");
        }
    }
}

impl StatusListener for EventForwarder {
    fn on_network_status(&self, ssid: &str, status: &str) {
        self.send(ControllerEvent::NetworkStatus {
            ssid: ssid.to_string(),
            status: status.to_string(),
        });
    }

    fn on_time_status(&self, auto_synced: bool, zone: &str) {
        self.send(ControllerEvent::TimeStatus {
            auto_synced,
            zone: zone.to_string(),
        });
    }
}

impl TransitionListener for EventForwarder {
    fn on_transition(&self, kind: TransitionKind) {
        self.send(ControllerEvent::Display(kind.is_on()));
    }
}

/// Everything a [`Controller`] is built from.
pub struct ControllerParts {
    pub settings: Settings,
    pub log: Arc<DiagnosticLog>,
    pub clock: Arc<dyn WallClock>,
    pub timers: Arc<dyn TimerScheduler>,
    /// Removable media holding the log sink and crash history.
    pub media: Arc<dyn PersistentStore>,
    /// Always-present fallback storage.
    pub data: Arc<dyn PersistentStore>,
    pub adapter: Arc<dyn NetworkAdapter>,
    pub time: Arc<dyn TimeSettings>,
    pub events: Sender<ControllerEvent>,
}

pub struct Controller {
    settings: Settings,
    zone: ScheduleZone,
    schedule: Arc<WeeklySchedule>,
    log: Arc<DiagnosticLog>,
    clock: Arc<dyn WallClock>,
    timers: Arc<dyn TimerScheduler>,
    media: Arc<dyn PersistentStore>,
    governor: CrashGovernor,
    scheduler: TimeWindowScheduler,
    establisher: ConnectionEstablisher,
    events: EventForwarder,
    restart: Mutex<Option<TimerHandle>>,
    me: Weak<Controller>,
}

impl Controller {
    pub fn new(parts: ControllerParts) -> Arc<Self> {
        let ControllerParts {
            settings,
            log,
            clock,
            timers,
            media,
            data,
            adapter,
            time,
            events,
        } = parts;

        let events = EventForwarder::new(events);

        let probe = Arc::clone(&media);
        log.set_sink_probe(Arc::new(move || probe.is_available()));

        let crash_store = if media.is_available() {
            Arc::clone(&media)
        } else {
            Arc::clone(&data)
        };
        let governor = CrashGovernor::new(
            settings.crash.policy(),
            crash_store,
            Arc::clone(&clock),
            Arc::clone(&log),
        );

        let scheduler = TimeWindowScheduler::new(
            Arc::clone(&timers),
            data,
            Arc::clone(&clock),
            Arc::clone(&log),
        );
        scheduler.set_listener(Arc::new(events.clone()));
        let schedule = settings
            .schedule
            .as_ref()
            .map(|document| scheduler.load(document))
            .unwrap_or_default();

        let establisher =
            ConnectionEstablisher::new(adapter, time, Arc::clone(&timers), Arc::clone(&log));
        establisher.set_status_listener(Arc::new(events.clone()));

        Arc::new_cyclic(|me| Self {
            zone: settings.zone(),
            settings,
            schedule: Arc::new(schedule),
            log,
            clock,
            timers,
            media,
            governor,
            scheduler,
            establisher,
            events,
            restart: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Show the last known state, snapshot the settings, and bring up
    /// whatever the current storage allows.
    pub fn start(&self) {
        info!(zone = %self.zone, "controller starting");
        self.log.add_log("Phoenix controller starting");
        self.events
            .send(ControllerEvent::Display(self.scheduler.current_state()));

        match self.settings.redacted_json() {
            Ok(json) => {
                self.log
                    .write_deferred_file(SETTINGS_SNAPSHOT_FILE, &json, WriteMode::Overwrite)
            }
            Err(e) => warn!(error = %e, "failed to render settings snapshot"),
        }

        if self.media.is_available() {
            self.on_storage_mounted();
        } else {
            info!("media not mounted, waiting");
            self.log.add_log("Waiting for storage to be mounted");
        }
    }

    pub fn on_storage_mounted(&self) {
        info!("storage mounted");
        self.log.add_log("Storage mounted");

        match self.media.resolve_root() {
            Some(root) => self.log.attach_sink(root, self.settings.logging.rotation()),
            None => warn!("storage reported mounted but has no root"),
        }

        match self.governor.migrate_to(Arc::clone(&self.media)) {
            Migration::AlreadyThere => debug!("crash history already on media"),
            Migration::Moved { entries } => self
                .log
                .add_log(format!("Moved {entries} crash records to storage")),
            Migration::Deferred { entries } => self.log.add_log(format!(
                "Storage not writable yet; {entries} crash records kept in memory"
            )),
        }
        self.governor.flush_pending();

        self.connect_then_schedule();
    }

    pub fn on_storage_removed(&self) {
        info!("storage removed");
        self.log.add_log("Storage removed");
        self.log.detach_sink();
        self.scheduler.stop();
        self.establisher.cancel();
    }

    /// Join the network for time sync, then arm the schedule. Without a
    /// configured network the schedule is armed straight away.
    pub fn connect_then_schedule(&self) {
        let Some(config) = self.settings.connect_config() else {
            self.log
                .add_log("No network configured; trusting the device clock");
            self.arm_schedule();
            return;
        };

        let me = self.me.clone();
        self.establisher.start(config, move |outcome| {
            if let Some(controller) = me.upgrade() {
                controller.on_connect_finished(outcome);
            }
        });
    }

    fn on_connect_finished(&self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::Cancelled => {
                debug!("connection run cancelled, leaving schedule alone");
                return;
            }
            ConnectOutcome::Connected { auto_time } => {
                info!(auto_time, "network setup finished");
            }
            ConnectOutcome::Failed(reason) => {
                warn!(?reason, "network setup failed");
                self.log.add_log(format!(
                    "Network setup failed ({reason:?}); scheduling on the device clock"
                ));
            }
        }
        self.arm_schedule();
    }

    /// Arm the next flip and publish the state the schedule wants now.
    pub fn arm_schedule(&self) {
        let outcome = self
            .scheduler
            .schedule_next(Arc::clone(&self.schedule), self.zone);
        if let ScheduleOutcome::NoTransitions = outcome {
            debug!("schedule has nothing ahead, display stays as computed");
        }
        self.events
            .send(ControllerEvent::Display(self.scheduler.current_state()));
    }

    /// Record a crash and arm at most one restart.
    pub fn on_failure(&self, details: &str) {
        warn!(details, "controller failure");
        self.log.add_log(format!("Failure: {details}"));
        self.governor.record_and_prune(self.clock.now_millis());

        let mut restart = self.lock_restart();
        if restart.is_some() {
            debug!("restart already pending");
            return;
        }

        match self.governor.next_restart_delay() {
            Some(delay) => {
                let me = self.me.clone();
                let handle = self.timers.post_after(
                    delay,
                    Box::new(move || {
                        if let Some(controller) = me.upgrade() {
                            controller.restart();
                        }
                    }),
                );
                *restart = Some(handle);
                info!(delay_ms = delay.as_millis() as u64, "restart scheduled");
                self.log
                    .add_log(format!("Restart scheduled in {} ms", delay.as_millis()));
                self.events.send(ControllerEvent::RestartScheduled(delay));
            }
            None => {
                let recent = self.governor.recent_count();
                warn!(recent, "too many recent crashes, not restarting");
                self.log.add_log(format!(
                    "Too many crashes ({recent} within window); not restarting"
                ));
                self.events.send(ControllerEvent::RestartsExhausted);
            }
        }
    }

    fn restart(&self) {
        self.lock_restart().take();
        info!("restarting controller");
        self.log.add_log("Restarting controller");
        self.establisher.cancel();
        self.scheduler.stop();
        self.start();
    }

    /// Leave a trace of an unrecoverable error for the next boot.
    pub fn report_fatal(&self, details: &str) {
        self.governor.report_fatal(details);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.lock_restart().take() {
            self.timers.cancel(handle);
        }
        self.establisher.cancel();
        self.log.add_log("Phoenix controller stopped");
        self.log.flush();
    }

    pub fn governor(&self) -> &CrashGovernor {
        &self.governor
    }

    pub fn scheduler(&self) -> &TimeWindowScheduler {
        &self.scheduler
    }

    pub fn establisher(&self) -> &ConnectionEstablisher {
        &self.establisher
    }

    pub fn restart_pending(&self) -> bool {
        self.lock_restart().is_some()
    }

    fn lock_restart(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.restart.lock().unwrap_or_else(|e| e.into_inner())
    }
}

//! Bounded-retry network join followed by a time sync handshake.
//!
//! A run walks `Idle -> EnablingRadio -> WaitingEnabled -> Configuring ->
//! AddingNetwork(n) -> Connecting(n) -> Connected | Failed`. Every wait is a
//! timer posted to the [`TimerScheduler`], and every wait is bounded, so the
//! completion callback always fires: once per [`ConnectionEstablisher::start`],
//! with [`ConnectOutcome::Cancelled`] if the run is cancelled or superseded.
//!
//! Each posted step carries the generation of the run that posted it. Starting
//! or cancelling bumps the generation, so a step that was already queued when
//! the cancel landed does nothing when it fires.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use phoenix_log::DiagnosticLog;
use phoenix_runtime::{TimerHandle, TimerScheduler};
use tracing::{debug, info, warn};

use crate::{AdapterError, ConnectConfig, NetworkAdapter, RadioState, StatusListener, TimeSettings};

pub const STATUS_WAITING: &str = "(Waiting for connection...)";
pub const STATUS_CONNECTING: &str = "(Connecting...)";
pub const STATUS_CONNECTED: &str = "(Connected Successfully)";
pub const STATUS_FAILED: &str = "(CONNECTION FAILED - CHECK PASSWORD)";
pub const STATUS_DISCONNECTED: &str = "(Disconnected Successfully)";

/// Polls never run tighter than this, whatever the settings say.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    EnablingRadio,
    WaitingEnabled,
    Configuring,
    AddingNetwork { attempt: u32 },
    Connecting { attempt: u32 },
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No credential profile could be added and the radio never connected.
    AddNetworkExhausted,
    /// The profile was added but the connection never came up.
    ConnectTimeout,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected { auto_time: bool },
    Failed(FailureReason),
    Cancelled,
}

/// Called exactly once per run.
pub type Completion = Box<dyn FnOnce(ConnectOutcome) + Send + 'static>;

#[derive(Debug, Clone, Copy)]
enum Step {
    PollEnabled,
    PollGrace,
    AddNetwork,
    PollConnection,
    TimeSync,
}

struct Run {
    generation: u64,
    state: ConnectState,
    config: Option<Arc<ConnectConfig>>,
    on_complete: Option<Completion>,
    timer: Option<TimerHandle>,
    enable_waited: Duration,
    grace_waited: Duration,
    add_attempt: u32,
    poll_attempt: u32,
    profile_added: bool,
}

/// Side effects gathered under the lock and delivered after releasing it.
enum Effect {
    Network(String, &'static str),
    Time(bool, String),
    Complete(Completion, ConnectOutcome),
}

#[derive(Default)]
struct Effects(Vec<Effect>);

impl Effects {
    fn network(&mut self, ssid: &str, status: &'static str) {
        self.0.push(Effect::Network(ssid.to_string(), status));
    }
}

struct Inner {
    adapter: Arc<dyn NetworkAdapter>,
    time: Arc<dyn TimeSettings>,
    timers: Arc<dyn TimerScheduler>,
    log: Arc<DiagnosticLog>,
    listener: Mutex<Option<Arc<dyn StatusListener>>>,
    run: Mutex<Run>,
    me: Weak<Inner>,
}

/// Joins the configured network, syncs time, and reports back.
pub struct ConnectionEstablisher {
    inner: Arc<Inner>,
}

impl ConnectionEstablisher {
    pub fn new(
        adapter: Arc<dyn NetworkAdapter>,
        time: Arc<dyn TimeSettings>,
        timers: Arc<dyn TimerScheduler>,
        log: Arc<DiagnosticLog>,
    ) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            adapter,
            time,
            timers,
            log,
            listener: Mutex::new(None),
            run: Mutex::new(Run {
                generation: 0,
                state: ConnectState::Idle,
                config: None,
                on_complete: None,
                timer: None,
                enable_waited: Duration::ZERO,
                grace_waited: Duration::ZERO,
                add_attempt: 0,
                poll_attempt: 0,
                profile_added: false,
            }),
            me: me.clone(),
        });
        Self { inner }
    }

    pub fn set_status_listener(&self, listener: Arc<dyn StatusListener>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Begin a run, cancelling any run already in flight.
    pub fn start(
        &self,
        config: ConnectConfig,
        on_complete: impl FnOnce(ConnectOutcome) + Send + 'static,
    ) {
        let inner = &self.inner;
        let mut fx = Effects::default();
        {
            let mut run = inner.lock_run();
            inner.abort(&mut run, &mut fx);

            let config = Arc::new(config);
            run.config = Some(Arc::clone(&config));
            run.on_complete = Some(Box::new(on_complete));
            run.enable_waited = Duration::ZERO;
            run.grace_waited = Duration::ZERO;
            run.add_attempt = 0;
            run.poll_attempt = 0;
            run.profile_added = false;

            info!(
                ssid = %config.ssid(),
                generation = run.generation,
                "starting connection run"
            );
            fx.network(config.ssid(), STATUS_WAITING);
            inner.begin(&mut run, &config);
        }
        inner.deliver(fx);
    }

    /// Abandon the current run. Its completion fires with
    /// [`ConnectOutcome::Cancelled`] if it had not fired yet.
    pub fn cancel(&self) {
        let mut fx = Effects::default();
        {
            let mut run = self.inner.lock_run();
            self.inner.abort(&mut run, &mut fx);
        }
        self.inner.deliver(fx);
    }

    pub fn state(&self) -> ConnectState {
        self.inner.lock_run().state
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.lock_run().on_complete.is_some()
    }
}

impl Drop for ConnectionEstablisher {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Inner {
    fn lock_run(&self) -> MutexGuard<'_, Run> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(&self, run: &mut Run, step: Step, delay: Duration) {
        let me = self.me.clone();
        let generation = run.generation;
        let handle = self.timers.post_after(
            delay,
            Box::new(move || {
                if let Some(inner) = me.upgrade() {
                    inner.on_step(generation, step);
                }
            }),
        );
        run.timer = Some(handle);
        debug!(
            ?step,
            generation,
            delay_ms = delay.as_millis() as u64,
            "scheduled connection step"
        );
    }

    fn on_step(&self, generation: u64, step: Step) {
        let mut fx = Effects::default();
        {
            let mut run = self.lock_run();
            if run.generation != generation || run.on_complete.is_none() {
                debug!(?step, generation, "ignoring step from a finished run");
                return;
            }
            run.timer = None;
            let Some(config) = run.config.clone() else {
                return;
            };

            match step {
                Step::PollEnabled => self.poll_enabled(&mut run, &config),
                Step::PollGrace => self.poll_grace(&mut run, &config),
                Step::AddNetwork => self.add_network(&mut run, &config, &mut fx),
                Step::PollConnection => self.poll_connection(&mut run, &config, &mut fx),
                Step::TimeSync => self.report_time(&mut run, &config, &mut fx),
            }
        }
        self.deliver(fx);
    }

    fn begin(&self, run: &mut Run, config: &ConnectConfig) {
        let state = self.adapter.radio_state();
        self.log
            .add_log(format!("Radio enabled: {}", state == RadioState::Enabled));
        self.log.add_log(format!("Radio state: {state}"));

        if !self.adapter.can_change_radio() {
            warn!("missing permission to change radio state");
            self.log.add_log(
                "Warning: missing permission to change radio state; enabling or configuring the network may fail",
            );
        }

        if state == RadioState::Enabled {
            self.configure(run, config);
            return;
        }

        run.state = ConnectState::EnablingRadio;
        if state != RadioState::Enabling {
            self.log.add_log("Radio appears disabled; attempting to enable...");
            if let Err(e) = self.adapter.set_radio_enabled(true) {
                warn!(error = %e, "failed to enable radio");
                self.log.add_log(format!("Failed to enable radio: {e}"));
            }
        }

        let wait = config.initial_enable_wait();
        run.state = ConnectState::WaitingEnabled;
        run.enable_waited = wait;
        self.schedule(run, Step::PollEnabled, wait);
    }

    fn poll_enabled(&self, run: &mut Run, config: &ConnectConfig) {
        let state = self.adapter.radio_state();
        self.log.add_log(format!("Radio state after enable: {state}"));

        if state == RadioState::Enabled {
            self.configure(run, config);
            return;
        }

        if run.enable_waited < config.max_enable_wait() {
            let interval = config.state_poll_interval.max(MIN_POLL_INTERVAL);
            run.enable_waited += interval;
            self.schedule(run, Step::PollEnabled, interval);
            return;
        }

        self.log.add_log(format!(
            "Timed out waiting for radio to become ENABLED (state={state})"
        ));
        match state {
            RadioState::Enabling => {
                self.log.add_log(format!(
                    "Radio still ENABLING; extending wait by {}ms before best-effort configure",
                    config.enabling_extra_grace.as_millis()
                ));
                let interval = config.enabling_extra_poll.max(MIN_POLL_INTERVAL);
                run.grace_waited = interval;
                self.schedule(run, Step::PollGrace, interval);
            }
            RadioState::Disabled => {
                self.log
                    .add_log("Turn the radio on manually in the device settings");
                self.configure(run, config);
            }
            _ => {
                self.log.add_log(format!(
                    "Proceeding with network configuration as a best-effort; radio is {state}"
                ));
                self.configure(run, config);
            }
        }
    }

    fn poll_grace(&self, run: &mut Run, config: &ConnectConfig) {
        let state = self.adapter.radio_state();
        self.log.add_log(format!("Radio state after enable: {state}"));

        if state == RadioState::Enabled {
            self.configure(run, config);
        } else if run.grace_waited >= config.enabling_extra_grace {
            self.log.add_log(format!(
                "Extended wait expired; proceeding with best-effort configuration (state={state})"
            ));
            self.configure(run, config);
        } else {
            let interval = config.enabling_extra_poll.max(MIN_POLL_INTERVAL);
            run.grace_waited += interval;
            self.schedule(run, Step::PollGrace, interval);
        }
    }

    fn configure(&self, run: &mut Run, config: &ConnectConfig) {
        run.state = ConnectState::Configuring;
        let ssid = config.ssid();

        match self.adapter.remove_profiles(ssid) {
            Ok(0) => {}
            Ok(removed) => self
                .log
                .add_log(format!("Removed {removed} stale profile(s) for \"{ssid}\"")),
            Err(e) => {
                warn!(error = %e, "failed to remove stale profiles");
                self.log
                    .add_log(format!("Could not remove stale profiles for \"{ssid}\": {e}"));
            }
        }

        let delay = config.add_post_delay();
        self.log.add_log(format!(
            "Scheduling network add (post-delay {}ms): \"{ssid}\"",
            delay.as_millis()
        ));
        self.schedule(run, Step::AddNetwork, delay);
    }

    fn add_network(&self, run: &mut Run, config: &ConnectConfig, fx: &mut Effects) {
        run.add_attempt += 1;
        let attempt = run.add_attempt;
        let max = config.add_attempts();
        let ssid = config.ssid();
        run.state = ConnectState::AddingNetwork { attempt };

        self.log
            .add_log(format!("Network add attempt {attempt}/{max} for \"{ssid}\""));
        match self.adapter.add_profile(&config.credentials) {
            Ok(id) => {
                self.log
                    .add_log(format!("Network add result: Configured ({id})"));
                run.profile_added = true;
                if let Err(e) = self.adapter.activate_profile(id) {
                    self.log
                        .add_log(format!("Error enabling network id {id}: {e}"));
                }
                self.poll_connection(run, config, fx);
            }
            Err(e) => {
                self.log.add_log(format!("Network add result: Failed ({e})"));
                if attempt < max {
                    let delay = config.add_retry_delay(attempt);
                    self.log.add_log(format!(
                        "Adding network failed; retrying in {}ms",
                        delay.as_millis()
                    ));
                    self.schedule(run, Step::AddNetwork, delay);
                } else {
                    warn!(attempts = attempt, "adding network profile exhausted");
                    self.log
                        .add_log(format!("Adding network failed after {attempt} attempts"));
                    // Keep polling: the radio may still join a known network
                    self.poll_connection(run, config, fx);
                }
            }
        }
    }

    fn poll_connection(&self, run: &mut Run, config: &ConnectConfig, fx: &mut Effects) {
        run.poll_attempt += 1;
        let attempt = run.poll_attempt;
        let max = config.connect_attempts();
        run.state = ConnectState::Connecting { attempt };

        let connected = self
            .adapter
            .connection_info()
            .is_connected_to(config.ssid());
        let status = if connected {
            STATUS_CONNECTED
        } else if attempt >= max {
            STATUS_FAILED
        } else {
            STATUS_CONNECTING
        };
        fx.network(config.ssid(), status);
        self.log.add_log(format!(
            "Attempt {attempt}/{max} - Status: {}",
            if connected { "Connected" } else { "Connecting" }
        ));

        if connected {
            info!(ssid = %config.ssid(), attempt, "network connected");
            self.log.add_log("Network connected successfully");
            self.sync_time(run, config);
        } else if attempt < max {
            self.schedule(run, Step::PollConnection, config.attempt_delay);
        } else {
            self.log
                .add_log(format!("Connection failed after {attempt} attempts"));
            let reason = if run.profile_added {
                FailureReason::ConnectTimeout
            } else {
                FailureReason::AddNetworkExhausted
            };
            self.finish(run, ConnectOutcome::Failed(reason), fx);
        }
    }

    fn sync_time(&self, run: &mut Run, config: &ConnectConfig) {
        let auto_time = match self.time.auto_time_enabled() {
            Ok(true) => {
                self.log.add_log("Automatic time already enabled");
                true
            }
            Ok(false) => {
                warn!("automatic time is disabled");
                self.log.add_log(
                    "Automatic time is DISABLED: enable automatic date & time in the device settings",
                );
                false
            }
            Err(e) => {
                self.log
                    .add_log(format!("Unable to read automatic time state: {e}"));
                false
            }
        };

        match self.time.auto_time_zone_enabled() {
            Ok(true) => {}
            Ok(false) => {
                warn!("automatic time zone is disabled");
                self.log.add_log(
                    "Automatic time zone is DISABLED: enable automatic time zone in the device settings",
                );
            }
            Err(e) => debug!(error = %e, "unable to read automatic time zone state"),
        }

        if auto_time {
            self.log.add_log("Setting system time...");
        } else {
            self.log
                .add_log("Skipping system time set because automatic time is disabled");
        }

        let zone = &config.time_zone;
        match self.time.set_time_zone(zone) {
            Ok(()) => self.log.add_log(format!("Time zone set to: {zone}")),
            Err(AdapterError::PermissionDenied(_)) => {
                warn!(zone = %zone, "no permission to set time zone");
                self.log.add_log(format!(
                    "No permission to set time zone: skipping explicit time zone set. Requested: {zone}"
                ));
            }
            Err(e) => self.log.add_log(format!("Time zone set error: {e}")),
        }

        self.schedule(run, Step::TimeSync, config.time_sync_delay);
    }

    fn report_time(&self, run: &mut Run, config: &ConnectConfig, fx: &mut Effects) {
        let auto_time = self.time.auto_time_enabled().unwrap_or(false);
        fx.0.push(Effect::Time(auto_time, config.time_zone.clone()));

        if config.disconnect_after_sync {
            self.disconnect(config, fx);
        }
        self.finish(run, ConnectOutcome::Connected { auto_time }, fx);
    }

    fn disconnect(&self, config: &ConnectConfig, fx: &mut Effects) {
        if let Err(e) = self.adapter.disconnect() {
            self.log.add_log(format!("Disconnect error: {e}"));
        }
        if self.adapter.can_change_radio() {
            if let Err(e) = self.adapter.remove_profiles(config.ssid()) {
                self.log
                    .add_log(format!("Could not remove saved network profile: {e}"));
            }
        } else {
            self.log.add_log(
                "Missing permission: skipping removal of saved network profiles",
            );
        }
        fx.network("", STATUS_DISCONNECTED);
        self.log.add_log("Network disconnected");
    }

    fn finish(&self, run: &mut Run, outcome: ConnectOutcome, fx: &mut Effects) {
        run.state = match outcome {
            ConnectOutcome::Connected { .. } => ConnectState::Connected,
            ConnectOutcome::Failed(_) => ConnectState::Failed,
            ConnectOutcome::Cancelled => ConnectState::Idle,
        };
        if let Some(handle) = run.timer.take() {
            self.timers.cancel(handle);
        }
        if let Some(on_complete) = run.on_complete.take() {
            info!(?outcome, generation = run.generation, "connection run finished");
            fx.0.push(Effect::Complete(on_complete, outcome));
        }
    }

    fn abort(&self, run: &mut Run, fx: &mut Effects) {
        run.generation += 1;
        if run.on_complete.is_some() {
            self.log.add_log("Connection attempt cancelled");
            self.finish(run, ConnectOutcome::Cancelled, fx);
        } else if let Some(handle) = run.timer.take() {
            self.timers.cancel(handle);
        }
    }

    fn deliver(&self, fx: Effects) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for effect in fx.0 {
            match effect {
                Effect::Network(ssid, status) => {
                    if let Some(listener) = &listener {
                        listener.on_network_status(&ssid, status);
                    }
                }
                Effect::Time(auto_synced, zone) => {
                    if let Some(listener) = &listener {
                        listener.on_time_status(auto_synced, &zone);
                    }
                }
                Effect::Complete(on_complete, outcome) => on_complete(outcome),
            }
        }
    }
}

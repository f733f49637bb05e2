//! Main daemon loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use miette::Result;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use phoenix_log::DiagnosticLog;
use phoenix_runtime::{
    DirStore, Dispatcher, PersistentStore, SystemClock, WallClock, panic_message,
};

use crate::controller::{Controller, ControllerEvent, ControllerParts};
use crate::host::{HostNetwork, HostTime};
use crate::settings::Settings;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub settings_path: PathBuf,
    /// Removable media; may be absent at startup and come and go.
    pub media_dir: PathBuf,
    /// Local fallback storage, created if missing.
    pub data_dir: PathBuf,
    pub storage_poll: Duration,
}

/// Read the settings file, falling back to defaults when there is none.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        warn!(path = %path.display(), "settings file not found, using defaults");
        return Ok(Settings::default());
    }
    Settings::load(path).map_err(|e| miette::miette!("{}", e))
}

/// Run the daemon until Ctrl-C.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let settings = load_settings(&config.settings_path)?;
    info!(
        settings = %config.settings_path.display(),
        media = %config.media_dir.display(),
        data = %config.data_dir.display(),
        "starting phoenix daemon"
    );

    let clock: Arc<dyn WallClock> = Arc::new(SystemClock);
    let log = Arc::new(
        DiagnosticLog::with_clock(settings.logging.log_config(), Arc::clone(&clock))
            .map_err(|e| miette::miette!("failed to start diagnostic log: {}", e))?,
    );
    let data: Arc<dyn PersistentStore> = Arc::new(
        DirStore::create(&config.data_dir)
            .map_err(|e| miette::miette!("failed to create data directory: {}", e))?,
    );
    let media: Arc<dyn PersistentStore> = Arc::new(DirStore::new(&config.media_dir));

    let (dispatcher, dispatch_loop) = Dispatcher::new(Arc::clone(&clock));
    let (events_tx, events_rx) = channel::unbounded();
    spawn_event_logger(events_rx)?;

    let controller = Controller::new(ControllerParts {
        adapter: Arc::new(HostNetwork::new(settings.wifi.ssid.trim())),
        time: Arc::new(HostTime::new()),
        settings,
        log: Arc::clone(&log),
        clock,
        timers: Arc::new(dispatcher.clone()),
        media: Arc::clone(&media),
        data,
        events: events_tx,
    });

    // Panics on the dispatch loop become crash records and a restart
    let weak = Arc::downgrade(&controller);
    dispatcher.set_failure_hook(Arc::new(move |details: &str| {
        if let Some(controller) = weak.upgrade() {
            controller.on_failure(details);
        }
    }));
    install_panic_hook(&controller);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let weak = Arc::downgrade(&controller);
    dispatcher.post(Box::new(move || {
        if let Some(controller) = weak.upgrade() {
            controller.start();
        }
    }));

    let watcher = tokio::spawn(watch_storage(
        media,
        dispatcher.clone(),
        Arc::downgrade(&controller),
        config.storage_poll,
        shutdown_rx.clone(),
    ));

    dispatch_loop.run(shutdown_rx).await;

    controller.shutdown();
    let _ = shutdown_tx.send(true);
    if let Err(e) = watcher.await {
        warn!(error = %e, "storage watcher ended abnormally");
    }
    log.shutdown();

    info!("phoenix daemon stopped");
    Ok(())
}

/// Post mount and removal events whenever the media's availability flips.
async fn watch_storage(
    media: Arc<dyn PersistentStore>,
    dispatcher: Dispatcher,
    controller: std::sync::Weak<Controller>,
    poll: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut mounted = media.is_available();
    let mut ticker = tokio::time::interval(poll);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }

        let available = media.is_available();
        if available == mounted {
            continue;
        }
        mounted = available;
        debug!(mounted, "media availability changed");

        let controller = controller.clone();
        dispatcher.post(Box::new(move || {
            if let Some(controller) = controller.upgrade() {
                if available {
                    controller.on_storage_mounted();
                } else {
                    controller.on_storage_removed();
                }
            }
        }));
    }
}

/// Leave a fatal crash report for any panic, then defer to the default hook.
fn install_panic_hook(controller: &Arc<Controller>) {
    let weak = Arc::downgrade(controller);
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if let Some(controller) = weak.upgrade() {
            let mut details = panic_message(info.payload());
            if let Some(location) = info.location() {
                details.push_str(&format!(" at {}:{}", location.file(), location.line()));
            }
            controller.report_fatal(&details);
        }
        previous(info);
    }));
}

fn spawn_event_logger(events: Receiver<ControllerEvent>) -> Result<()> {
    std::thread::Builder::new()
        .name("phoenix-events".to_string())
        .spawn(move || {
            for event in events {
                match event {
                    ControllerEvent::Display(on) => info!(on, "display"),
                    ControllerEvent::NetworkStatus { ssid, status } => {
                        info!(%ssid, %status, "network status")
                    }
                    ControllerEvent::TimeStatus { auto_synced, zone } => {
                        info!(auto_synced, %zone, "time status")
                    }
                    ControllerEvent::RestartScheduled(delay) => {
                        info!(delay_ms = delay.as_millis() as u64, "restart scheduled")
                    }
                    ControllerEvent::RestartsExhausted => warn!("restarts exhausted"),
                }
            }
        })
        .map_err(|e| miette::miette!("failed to spawn event thread: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_bad_settings_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(load_settings(&path).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_watcher_posts_flips() {
        let dir = tempfile::tempdir().unwrap();
        let media_dir = dir.path().join("media");
        let media: Arc<dyn PersistentStore> = Arc::new(DirStore::new(&media_dir));
        let (dispatcher, _loop) = Dispatcher::new(Arc::new(SystemClock));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = tokio::spawn(watch_storage(
            media,
            dispatcher.clone(),
            std::sync::Weak::new(),
            Duration::from_millis(100),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(dispatcher.pending(), 0);

        std::fs::create_dir_all(&media_dir).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(dispatcher.pending(), 1);

        shutdown_tx.send(true).unwrap();
        watcher.await.unwrap();
    }
}

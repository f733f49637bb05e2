//! Phoenix: unattended kiosk controller
//!
//! Main binary with subcommands:
//! - `daemon`: Run the controller (schedule, network time sync, crash recovery)
//! - `preview`: Show upcoming schedule transitions and the alarm that would be armed
//! - `state`: Print whether the schedule says ON or OFF
//! - `crashes`: Show the crash history and the restart verdict

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phoenix_crash::CrashGovernor;
use phoenix_log::DiagnosticLog;
use phoenix_runtime::{DirStore, PersistentStore, SystemClock};

mod controller;
mod daemon;
mod error;
mod host;
mod inspect;
mod settings;

#[derive(Parser)]
#[command(name = "phoenix")]
#[command(about = "Unattended kiosk controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Daemon {
        /// Settings file (JSON)
        #[arg(long, env = "PHOENIX_SETTINGS")]
        settings: Option<PathBuf>,

        /// Removable media directory for logs and crash history
        #[arg(long, env = "PHOENIX_MEDIA_DIR")]
        media_dir: Option<PathBuf>,

        /// Local fallback directory
        #[arg(long, env = "PHOENIX_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// How often to check whether the media is mounted, in milliseconds
        #[arg(long, env = "PHOENIX_STORAGE_POLL_MS", default_value = "2000")]
        storage_poll_ms: u64,
    },

    /// Show upcoming transitions and the alarm that would be armed
    Preview {
        /// Settings file (JSON)
        #[arg(long, env = "PHOENIX_SETTINGS")]
        settings: Option<PathBuf>,

        /// Instant to preview from (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Number of transitions to list
        #[arg(long, default_value = "10")]
        count: usize,
    },

    /// Print ON or OFF for the given instant
    State {
        /// Settings file (JSON)
        #[arg(long, env = "PHOENIX_SETTINGS")]
        settings: Option<PathBuf>,

        /// Instant to evaluate (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Show the crash history and whether a restart would be allowed
    Crashes {
        /// Settings file (JSON)
        #[arg(long, env = "PHOENIX_SETTINGS")]
        settings: Option<PathBuf>,

        /// Removable media directory
        #[arg(long, env = "PHOENIX_MEDIA_DIR")]
        media_dir: Option<PathBuf>,

        /// Local fallback directory
        #[arg(long, env = "PHOENIX_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
}

fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phoenix")
        .join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phoenix")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("/media/phoenix")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "phoenix=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            settings,
            media_dir,
            data_dir,
            storage_poll_ms,
        } => {
            daemon::run(daemon::DaemonConfig {
                settings_path: settings.unwrap_or_else(default_settings_path),
                media_dir: media_dir.unwrap_or_else(default_media_dir),
                data_dir: data_dir.unwrap_or_else(default_data_dir),
                storage_poll: Duration::from_millis(storage_poll_ms.max(100)),
            })
            .await
        }

        Commands::Preview {
            settings,
            at,
            count,
        } => {
            let settings =
                daemon::load_settings(&settings.unwrap_or_else(default_settings_path))?;
            print!(
                "{}",
                inspect::preview(&settings, at.unwrap_or_else(Utc::now), count)
            );
            Ok(())
        }

        Commands::State { settings, at } => {
            let settings =
                daemon::load_settings(&settings.unwrap_or_else(default_settings_path))?;
            println!("{}", inspect::state(&settings, at.unwrap_or_else(Utc::now)));
            Ok(())
        }

        Commands::Crashes {
            settings,
            media_dir,
            data_dir,
        } => {
            let settings =
                daemon::load_settings(&settings.unwrap_or_else(default_settings_path))?;
            let media = DirStore::new(media_dir.unwrap_or_else(default_media_dir));
            let store: Arc<dyn PersistentStore> = if media.is_available() {
                Arc::new(media)
            } else {
                Arc::new(DirStore::new(data_dir.unwrap_or_else(default_data_dir)))
            };

            let log = Arc::new(
                DiagnosticLog::new(settings.logging.log_config())
                    .map_err(|e| miette::miette!("{}", e))?,
            );
            let governor = CrashGovernor::new(
                settings.crash.policy(),
                store,
                Arc::new(SystemClock),
                Arc::clone(&log),
            );
            print!("{}", inspect::crashes(&governor, &settings.zone()));
            log.shutdown();
            Ok(())
        }
    }
}

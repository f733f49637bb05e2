//! The diagnostic log service.
//!
//! Callers never block on file I/O. Every line goes into an in-memory ring for
//! live display and is handed to a worker thread, which owns the file sink.
//! While no sink is attached the worker buffers lines and deferred artifact
//! writes (bounded, oldest dropped) and replays them in order on attach.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use phoenix_runtime::{SystemClock, WallClock, WriteMode};
use tracing::{debug, info, warn};

use crate::sink::FileSink;
use crate::{LogConfig, LogEntry, RotationConfig, SinkError};

/// Answers whether a sink could ever be resolved.
///
/// Used by [`DiagnosticLog::add_pending_file_log`] to avoid buffering lines
/// for a destination that will never exist.
pub type SinkProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Snapshot of what is waiting for a sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub lines: usize,
    pub writes: usize,
    /// Lines evicted because the buffer was full.
    pub dropped_lines: u64,
    /// Deferred writes evicted because the buffer was full.
    pub dropped_writes: u64,
}

#[derive(Debug)]
struct PendingWrite {
    name: String,
    contents: String,
    mode: WriteMode,
}

enum Command {
    Line(String),
    Deferred(PendingWrite),
    Attach(PathBuf, RotationConfig),
    Detach,
    Flush(Sender<()>),
    Shutdown,
}

struct SinkState {
    sink: Option<FileSink>,
    lines: VecDeque<String>,
    writes: VecDeque<PendingWrite>,
    dropped_lines: u64,
    dropped_writes: u64,
    /// Set after a failed write so the error marker is only logged once per
    /// outage.
    failing: bool,
    /// Same, for deferred artifact writes.
    writes_failing: bool,
    config: LogConfig,
    clock: Arc<dyn WallClock>,
}

impl SinkState {
    fn push_line(&mut self, line: String) {
        while self.lines.len() >= self.config.pending_line_limit.max(1) {
            self.lines.pop_front();
            self.dropped_lines += 1;
        }
        self.lines.push_back(line);
    }

    fn push_write(&mut self, write: PendingWrite) {
        while self.writes.len() >= self.config.pending_write_limit.max(1) {
            if let Some(dropped) = self.writes.pop_front() {
                warn!(name = %dropped.name, "pending write buffer full, dropping oldest");
            }
            self.dropped_writes += 1;
        }
        self.writes.push_back(write);
    }

    fn marker(&mut self, message: String) {
        let line = LogEntry::new(self.clock.now(), message).line();
        self.push_line(line);
    }

    /// Write out everything buffered, deferred writes first, then lines in
    /// arrival order. A failing write or line stays queued for the next drain.
    fn drain(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };

        if !sink.is_available() {
            if !self.failing {
                warn!(dir = %sink.dir().display(), "log sink vanished, buffering");
                self.failing = true;
            }
            self.sink = Some(sink);
            return;
        }

        while let Some(write) = self.writes.pop_front() {
            match sink.write_artifact(&write.name, &write.contents, write.mode) {
                Ok(()) => self.writes_failing = false,
                Err(e) => {
                    if !self.writes_failing {
                        warn!(name = %write.name, error = %e, "deferred write failed, keeping it");
                        self.writes_failing = true;
                        self.marker(format!("[DEFERRED_WRITE_FAIL] {}: {e}", write.name));
                    }
                    self.writes.push_front(write);
                    break;
                }
            }
        }

        while let Some(line) = self.lines.front() {
            match sink.append_line(line) {
                Ok(()) => {
                    self.lines.pop_front();
                }
                Err(e) => {
                    if !self.failing {
                        warn!(error = %e, "failed to write log file, buffering");
                        self.failing = true;
                        self.marker(format!("[WRITE_ERROR] Failed to write to log file: {e}"));
                    }
                    self.sink = Some(sink);
                    return;
                }
            }
        }

        self.failing = false;
        self.sink = Some(sink);
    }
}

fn lock_state(state: &Mutex<SinkState>) -> MutexGuard<'_, SinkState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn run_worker(state: Arc<Mutex<SinkState>>, attached: Arc<AtomicBool>, rx: Receiver<Command>) {
    debug!("log worker starting");

    for command in rx.iter() {
        match command {
            Command::Line(line) => {
                let mut state = lock_state(&state);
                state.push_line(line);
                state.drain();
            }
            Command::Deferred(write) => {
                let mut state = lock_state(&state);
                state.push_write(write);
                state.drain();
            }
            Command::Attach(dir, rotation) => {
                let mut state = lock_state(&state);
                match FileSink::open(&dir, rotation) {
                    Ok(sink) => {
                        info!(dir = %dir.display(), "log sink attached");
                        state.sink = Some(sink);
                        state.failing = false;
                        attached.store(true, Ordering::Release);
                        state.drain();
                    }
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "failed to attach log sink");
                        state.marker(format!(
                            "[STORAGE_ERROR] Failed to configure log directory {}: {e}",
                            dir.display()
                        ));
                    }
                }
            }
            Command::Detach => {
                attached.store(false, Ordering::Release);
                let mut state = lock_state(&state);
                if let Some(sink) = state.sink.take() {
                    info!(dir = %sink.dir().display(), "log sink detached");
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => break,
        }
    }

    debug!("log worker stopped");
}

/// Shared diagnostic log.
///
/// Construct once at startup and hand an `Arc` to every component.
pub struct DiagnosticLog {
    config: LogConfig,
    clock: Arc<dyn WallClock>,
    ring: Mutex<VecDeque<LogEntry>>,
    state: Arc<Mutex<SinkState>>,
    /// Mirrors `state.sink.is_some()` without waiting on a drain in progress.
    attached: Arc<AtomicBool>,
    probe: Mutex<Option<SinkProbe>>,
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiagnosticLog {
    pub fn new(config: LogConfig) -> Result<Self, SinkError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a log that stamps entries with `clock`.
    pub fn with_clock(config: LogConfig, clock: Arc<dyn WallClock>) -> Result<Self, SinkError> {
        let (tx, rx) = channel::unbounded();
        let state = Arc::new(Mutex::new(SinkState {
            sink: None,
            lines: VecDeque::new(),
            writes: VecDeque::new(),
            dropped_lines: 0,
            dropped_writes: 0,
            failing: false,
            writes_failing: false,
            config: config.clone(),
            clock: Arc::clone(&clock),
        }));

        let attached = Arc::new(AtomicBool::new(false));
        let worker_state = Arc::clone(&state);
        let worker_attached = Arc::clone(&attached);
        let worker = thread::Builder::new()
            .name("phoenix-log".to_string())
            .spawn(move || run_worker(worker_state, worker_attached, rx))
            .map_err(SinkError::Worker)?;

        Ok(Self {
            config,
            clock,
            ring: Mutex::new(VecDeque::new()),
            state,
            attached,
            probe: Mutex::new(None),
            tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Record a line for display, the platform log, and the file sink.
    pub fn add_log(&self, message: impl Into<String>) {
        let entry = LogEntry::new(self.clock.now(), message);
        info!(target: "phoenix::diagnostic", "{}", entry.message);

        let line = entry.line();
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            ring.push_front(entry);
            ring.truncate(self.config.ring_capacity);
        }
        self.send(Command::Line(line));
    }

    /// Record a line for the file sink only.
    ///
    /// Dropped when there is no sink and the probe says none can ever be
    /// resolved.
    pub fn add_pending_file_log(&self, message: impl Into<String>) {
        if !self.has_sink() && !self.sink_resolvable() {
            return;
        }
        let line = LogEntry::new(self.clock.now(), message).line();
        self.send(Command::Line(line));
    }

    /// Write an artifact next to the log file now, or once a sink attaches.
    pub fn write_deferred_file(&self, name: &str, contents: &str, mode: WriteMode) {
        self.send(Command::Deferred(PendingWrite {
            name: name.to_string(),
            contents: contents.to_string(),
            mode,
        }));
    }

    /// Start writing to `dir`, flushing everything buffered first.
    pub fn attach_sink(&self, dir: impl AsRef<Path>, rotation: RotationConfig) {
        let dir = dir.as_ref().to_path_buf();
        let message = format!("Using removable storage for logs: {}", dir.display());
        self.send(Command::Attach(dir, rotation));
        self.add_log(message);
    }

    /// Stop writing to the file sink. Lines keep buffering for a later attach.
    pub fn detach_sink(&self) {
        self.send(Command::Detach);
        self.add_log("File logging disabled (storage removed)");
    }

    /// Install the probe consulted by [`add_pending_file_log`](Self::add_pending_file_log).
    pub fn set_sink_probe(&self, probe: SinkProbe) {
        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Some(probe);
    }

    /// Block until the worker has handled everything sent before this call.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = channel::bounded(1);
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Recent entries, newest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let state = lock_state(&self.state);
        PendingCounts {
            lines: state.lines.len(),
            writes: state.writes.len(),
            dropped_lines: state.dropped_lines,
            dropped_writes: state.dropped_writes,
        }
    }

    /// Whether a file sink is currently attached.
    pub fn has_sink(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Stop the worker after it has handled everything already sent.
    ///
    /// Later lines still reach the ring and the platform log.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = self.tx.send(Command::Shutdown);
            if worker.join().is_err() {
                warn!("log worker panicked");
            }
        }
    }

    fn sink_resolvable(&self) -> bool {
        let probe = self
            .probe
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        probe.is_none_or(|probe| probe())
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("log worker gone, dropping file output");
        }
    }
}

impl Drop for DiagnosticLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Timer capability and the tokio-backed dispatch context.
//!
//! All timer callbacks run on one [`DispatchLoop`], one after another. A
//! posted callback sleeps on its own tokio task, then hands itself to the
//! loop; the loop re-checks the handle registry before running it, so a
//! cancel that lands after the sleep finished still wins.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace};

use crate::WallClock;

/// A cooperative callback posted to the dispatch context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called with a description of a callback that panicked.
pub type FailureHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies a posted callback so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Posts callbacks to run later on the dispatch context.
pub trait TimerScheduler: Send + Sync {
    /// Run `task` at wall-clock instant `at` (immediately if it has passed).
    fn post_at(&self, at: DateTime<Utc>, task: Task) -> TimerHandle;

    /// Run `task` after `delay`.
    fn post_after(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Cancel a posted callback. Returns false if it already ran or was
    /// already cancelled.
    fn cancel(&self, handle: TimerHandle) -> bool;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    live: HashMap<u64, AbortHandle>,
}

struct Shared {
    clock: Arc<dyn WallClock>,
    registry: Mutex<Registry>,
    on_failure: Mutex<Option<FailureHook>>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle for posting callbacks to a [`DispatchLoop`].
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<(u64, Task)>,
    runtime: Handle,
}

impl Dispatcher {
    /// Create a dispatcher and the loop that runs its callbacks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(clock: Arc<dyn WallClock>) -> (Self, DispatchLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            clock,
            registry: Mutex::new(Registry::default()),
            on_failure: Mutex::new(None),
        });
        let dispatcher = Self {
            shared: Arc::clone(&shared),
            tx,
            runtime: Handle::current(),
        };
        (dispatcher, DispatchLoop { shared, rx })
    }

    /// Install the hook called whenever a callback panics.
    pub fn set_failure_hook(&self, hook: FailureHook) {
        *self
            .shared
            .on_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Run `task` on the dispatch context as soon as possible.
    pub fn post(&self, task: Task) -> TimerHandle {
        self.post_after(Duration::ZERO, task)
    }

    /// Number of callbacks posted but not yet run or cancelled.
    pub fn pending(&self) -> usize {
        self.shared.registry().live.len()
    }
}

impl TimerScheduler for Dispatcher {
    fn post_at(&self, at: DateTime<Utc>, task: Task) -> TimerHandle {
        let delay = (at - self.shared.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.post_after(delay, task)
    }

    fn post_after(&self, delay: Duration, task: Task) -> TimerHandle {
        // Registration happens under the lock so the loop cannot see the
        // callback before it is marked live.
        let mut registry = self.shared.registry();
        registry.next_id += 1;
        let id = registry.next_id;

        let tx = self.tx.clone();
        let join = self.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = tx.send((id, task));
        });
        registry.live.insert(id, join.abort_handle());
        trace!(id, delay_ms = delay.as_millis() as u64, "posted callback");

        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        match self.shared.registry().live.remove(&handle.id()) {
            Some(abort) => {
                abort.abort();
                trace!(id = handle.id(), "cancelled callback");
                true
            }
            None => false,
        }
    }
}

/// The single dispatch context that runs every posted callback.
pub struct DispatchLoop {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<(u64, Task)>,
}

impl DispatchLoop {
    /// Run callbacks until shutdown is signalled.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("dispatch loop starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("dispatch loop received shutdown signal");
                        break;
                    }
                }
                next = self.rx.recv() => match next {
                    Some((id, task)) => self.execute(id, task),
                    None => break,
                }
            }
        }

        info!("dispatch loop stopped");
    }

    fn execute(&self, id: u64, task: Task) {
        if self.shared.registry().live.remove(&id).is_none() {
            debug!(id, "dropping callback cancelled after it became due");
            return;
        }

        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            let message = panic_message(payload.as_ref());
            error!(id, error = %message, "callback panicked on dispatch loop");
            let hook = self
                .shared
                .on_failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(hook) = hook {
                hook(&message);
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_delay() {
        let (dispatcher, dispatch_loop) = Dispatcher::new(Arc::new(SystemClock));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(dispatch_loop.run(shutdown_rx));

        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.post_after(Duration::from_secs(5), counter_task(&counter));
        assert_eq!(dispatcher.pending(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending(), 0);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_callback_never_runs() {
        let (dispatcher, dispatch_loop) = Dispatcher::new(Arc::new(SystemClock));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(dispatch_loop.run(shutdown_rx));

        let counter = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.post_after(Duration::from_secs(5), counter_task(&counter));
        assert!(dispatcher.cancel(handle));
        assert!(!dispatcher.cancel(handle));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_due_but_before_run() {
        // The loop is not running yet, so the callback sits in the channel
        // after its sleep. Cancelling then must still prevent it.
        let (dispatcher, dispatch_loop) = Dispatcher::new(Arc::new(SystemClock));
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = dispatcher.post(counter_task(&counter));
        tokio::task::yield_now().await;
        assert!(dispatcher.cancel(handle));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(dispatch_loop.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_at_uses_wall_clock() {
        let (dispatcher, dispatch_loop) = Dispatcher::new(Arc::new(SystemClock));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(dispatch_loop.run(shutdown_rx));

        let counter = Arc::new(AtomicUsize::new(0));
        // An instant in the past runs right away
        dispatcher.post_at(
            Utc::now() - chrono::Duration::hours(1),
            counter_task(&counter),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained_and_reported() {
        let (dispatcher, dispatch_loop) = Dispatcher::new(Arc::new(SystemClock));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_task = tokio::spawn(dispatch_loop.run(shutdown_rx));

        let failures = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&failures);
        dispatcher.set_failure_hook(Arc::new(move |msg: &str| {
            sink.lock().unwrap().push(msg.to_string());
        }));

        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.post(Box::new(|| panic!("boom")));
        dispatcher.post_after(Duration::from_millis(5), counter_task(&counter));

        tokio::time::sleep(Duration::from_millis(10)).await;
        // The loop survived the panic and kept running callbacks
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(failures.lock().unwrap().as_slice(), ["boom".to_string()]);

        shutdown_tx.send(true).unwrap();
        loop_task.await.unwrap();
    }
}

//! Backend lifecycle: readiness state machine, stop signal and task ownership.
//!
//! State machine: `Loading -> Ready <-> Degraded`, any state `-> Stopped`.
//! Readiness lives in a `watch` channel so `wait_for_ready` can park until
//! the bootstrap finishes without polling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Backend health, as reported by `is_ready` and awaited by `wait_for_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Bootstrap scan in progress.
    Loading,
    /// Serving reads and accepting writes.
    Ready,
    /// Connectivity lost; cached reads still served.
    Degraded,
    /// Shut down; every background task has been joined.
    Stopped,
}

/// Independent health checks a backend reports. The backend is `Ready`
/// only while none of them is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Changefeed, notification channel or broker queue.
    ChangeCapture,
    /// Writes and periodic flushes to the backing store.
    Writes,
    /// Liveness heartbeat.
    Heartbeat,
    /// Periodic polling of the backing store.
    Poll,
}

impl Probe {
    fn bit(self) -> u8 {
        match self {
            Self::ChangeCapture => 1,
            Self::Writes => 1 << 1,
            Self::Heartbeat => 1 << 2,
            Self::Poll => 1 << 3,
        }
    }
}

/// Cloneable handle on a backend's stop flag, held by each background task.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once stop has been requested (or the owner is gone).
    pub async fn stopped(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }

    /// Sleeps for `duration` unless stopped first. Returns `true` to keep
    /// running, `false` when the task should exit.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => !self.is_stopped(),
            () = self.stopped() => false,
        }
    }
}

/// Owns a backend's readiness state, stop flag and background tasks.
///
/// Teardown order in [`shutdown`](Lifecycle::shutdown): flip the stop flag,
/// signal every task, join them all, then report `Stopped`. Connection
/// resources are released by the owning backend after this returns.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<StoreState>,
    stop_signal: watch::Sender<bool>,
    stopping: AtomicBool,
    failing: AtomicU8,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Loading` state.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(StoreState::Loading);
        let (stop_signal, _) = watch::channel(false);
        Self {
            state,
            stop_signal,
            stopping: AtomicBool::new(false),
            failing: AtomicU8::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> StoreState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == StoreState::Ready
    }

    /// Marks bootstrap (or resynchronization) complete. Lands in
    /// `Degraded` instead while any probe is failing.
    pub fn set_ready(&self) {
        if self.failing.load(Ordering::Acquire) == 0 {
            self.transition(StoreState::Ready);
        } else {
            self.transition(StoreState::Degraded);
        }
    }

    /// Records one probe's outcome. Before bootstrap completes this only
    /// updates the probe set; afterwards it moves between `Ready` and
    /// `Degraded`.
    pub fn report(&self, probe: Probe, healthy: bool) {
        let failing = if healthy {
            self.failing.fetch_and(!probe.bit(), Ordering::AcqRel) & !probe.bit()
        } else {
            self.failing.fetch_or(probe.bit(), Ordering::AcqRel) | probe.bit()
        };
        match self.state() {
            StoreState::Loading | StoreState::Stopped => {}
            StoreState::Ready | StoreState::Degraded => {
                if failing == 0 {
                    self.transition(StoreState::Ready);
                } else {
                    self.transition(StoreState::Degraded);
                }
            }
        }
    }

    /// Marks connectivity lost. Ignored while still loading: a backend that
    /// has not bootstrapped is not ready either way.
    pub fn set_degraded(&self) {
        self.state.send_if_modified(|state| {
            if *state == StoreState::Ready {
                *state = StoreState::Degraded;
                true
            } else {
                false
            }
        });
    }

    fn transition(&self, next: StoreState) {
        self.state.send_if_modified(|state| {
            if *state == StoreState::Stopped || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    /// Waits until the backend reports `Ready`. Returns `false` if it stops
    /// first.
    ///
    /// Must not be awaited from the backend's own ingestion task: that task
    /// is what eventually makes the backend ready.
    pub async fn wait_for_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        #[allow(clippy::let_and_return)]
        let ready = match rx
            .wait_for(|s| matches!(s, StoreState::Ready | StoreState::Stopped))
            .await
        {
            Ok(state) => *state == StoreState::Ready,
            Err(_) => false,
        };
        ready
    }

    /// Returns a stop handle for a background task.
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        StopSignal(self.stop_signal.subscribe())
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Spawns a background task whose handle is joined on shutdown. Once a
    /// stop was requested the task is dropped without running.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopping() {
            tracing::debug!("stop requested, background task not started");
            return;
        }
        let handle = tokio::spawn(task);
        self.tasks.lock().push(handle);
    }

    /// Flips the stop flag and signals every task without waiting for them.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.stop_signal.send_replace(true);
    }

    /// Stops and joins every background task. Idempotent.
    pub async fn shutdown(&self) {
        self.request_stop();
        let handles = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() && self.state() == StoreState::Stopped {
            return;
        }
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    tracing::error!(error = %err, "background task panicked");
                }
            }
        }
        self.state.send_replace(StoreState::Stopped);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.stop_signal.send_replace(true);
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

//! Periodic background loop with cooperative shutdown.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::TaskQueue;
use crate::task::{Task, TaskError};

/// Longest allowed sleep between two iterations.
pub const MAX_DAEMON_INTERVAL: Duration = Duration::from_millis(1000);

/// The step a [`Daemon`] runs on every tick.
pub trait Iterate: Send + Sync + 'static {
    /// Run one iteration. Returning `false` ends the loop.
    fn iterate(&self) -> bool;

    /// Called once when a stop is requested, before the loop is joined.
    fn on_stop(&self) {}
}

/// Lifecycle of a daemon. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DaemonState {
    Running = 0,
    StopRequested = 1,
    Stopped = 2,
}

impl DaemonState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::StopRequested,
            _ => Self::Stopped,
        }
    }
}

struct Shared {
    state: AtomicU8,
    wake: Notify,
    ticks: AtomicU64,
}

impl Shared {
    fn state(&self) -> DaemonState {
        DaemonState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Sleep/iterate loop on the tokio runtime, plus a private task queue for
/// commands that must be serialized with respect to each other.
pub struct Daemon {
    name: String,
    interval: Duration,
    shared: Arc<Shared>,
    step: Arc<dyn Iterate>,
    handle: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<TaskQueue>,
}

impl Daemon {
    /// Spawn the loop on the current tokio runtime.
    ///
    /// `interval` is clamped to [`MAX_DAEMON_INTERVAL`].
    pub fn start<S: Iterate>(name: impl Into<String>, interval: Duration, step: Arc<S>) -> Self {
        let name = name.into();
        let interval = interval.min(MAX_DAEMON_INTERVAL);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(DaemonState::Running as u8),
            wake: Notify::new(),
            ticks: AtomicU64::new(0),
        });
        let step: Arc<dyn Iterate> = step;

        let handle = tokio::spawn(run_loop(
            name.clone(),
            interval,
            shared.clone(),
            step.clone(),
        ));
        info!(daemon = %name, interval_ms = interval.as_millis() as u64, "daemon started");

        Self {
            queue: Arc::new(TaskQueue::new(format!("{name}-commands"))),
            name,
            interval,
            shared,
            step,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Request a stop, run the step's cancellation hook, and wait for the loop
    /// to finish. Pending commands are drained afterwards.
    ///
    /// Work the step spawned on its own is not waited for.
    pub async fn stop(&self) {
        let requested = self
            .shared
            .state
            .compare_exchange(
                DaemonState::Running as u8,
                DaemonState::StopRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if requested {
            info!(daemon = %self.name, "daemon stop requested");
            self.step.on_stop();
            self.shared.wake.notify_one();
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(daemon = %self.name, error = %e, "daemon loop ended abnormally");
            }
            let queue = self.queue.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || queue.flush()).await {
                warn!(daemon = %self.name, error = %e, "failed to drain daemon commands");
            }
            info!(daemon = %self.name, ticks = self.ticks(), "daemon stopped");
        }
        self.shared
            .state
            .store(DaemonState::Stopped as u8, Ordering::SeqCst);
    }

    /// Run `command` on the daemon's private queue, after every command
    /// dispatched before it.
    pub fn dispatch<F, T>(&self, command: F) -> Result<Task<T>, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.queue.submit(command)
    }

    pub fn state(&self) -> DaemonState {
        self.shared.state()
    }

    /// Iterations run so far.
    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        // The loop notices on its next wake-up; nothing to join from here.
        let _ = self.shared.state.compare_exchange(
            DaemonState::Running as u8,
            DaemonState::StopRequested as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.shared.wake.notify_one();
    }
}

async fn run_loop(name: String, interval: Duration, shared: Arc<Shared>, step: Arc<dyn Iterate>) {
    debug!(daemon = %name, "daemon loop entered");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.wake.notified() => {}
        }
        if shared.state() != DaemonState::Running {
            break;
        }
        shared.ticks.fetch_add(1, Ordering::SeqCst);
        if !step.iterate() {
            debug!(daemon = %name, "step asked the loop to end");
            break;
        }
    }
    shared
        .state
        .store(DaemonState::Stopped as u8, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use super::*;

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        limit: Option<usize>,
        stopped: AtomicBool,
    }

    impl Iterate for Counter {
        fn iterate(&self) -> bool {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.limit.is_none_or(|limit| n < limit)
        }

        fn on_stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn iterates_until_stopped() {
        let step = Arc::new(Counter::default());
        let daemon = Daemon::start("counter", Duration::from_millis(5), step.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(daemon.state(), DaemonState::Running);

        daemon.stop().await;
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(step.stopped.load(Ordering::SeqCst));

        let calls = step.calls.load(Ordering::SeqCst);
        assert!(calls > 0);
        assert_eq!(daemon.ticks(), calls as u64);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(step.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn step_returning_false_ends_the_loop() {
        let step = Arc::new(Counter {
            limit: Some(3),
            ..Counter::default()
        });
        let daemon = Daemon::start("limited", Duration::from_millis(1), step.clone());

        for _ in 0..500 {
            if daemon.state() == DaemonState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert_eq!(step.calls.load(Ordering::SeqCst), 3);

        // Stopping an already finished loop skips the hook.
        daemon.stop().await;
        assert!(!step.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn interval_is_clamped() {
        let daemon = Daemon::start(
            "slow",
            Duration::from_secs(30),
            Arc::new(Counter::default()),
        );
        assert_eq!(daemon.interval(), MAX_DAEMON_INTERVAL);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn stop_interrupts_the_sleep() {
        let daemon = Daemon::start(
            "sleepy",
            Duration::from_millis(1000),
            Arc::new(Counter::default()),
        );
        let started = std::time::Instant::now();
        daemon.stop().await;
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(daemon.ticks(), 0);
    }

    #[tokio::test]
    async fn dispatch_serializes_commands() {
        let daemon = Daemon::start("commands", Duration::from_millis(50), Arc::new(Counter::default()));
        let log = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let log = log.clone();
                daemon
                    .dispatch(move || log.lock().unwrap().push(i))
                    .expect("dispatch")
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);

        daemon.stop().await;
        assert!(matches!(daemon.dispatch(|| ()), Err(TaskError::QueueClosed)));
    }
}

//! Deferred units of work with a single-resolution completion signal.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Why a [`Task`] did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was still queued when its queue was cancelled.
    #[error("task cancelled before it ran")]
    Cancelled,

    /// The queue no longer accepts submissions.
    #[error("queue is closed")]
    QueueClosed,

    /// The unit of work panicked; the message is captured.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Handle to the eventual outcome of a submitted unit of work.
///
/// Await it from async code, or call [`Task::wait`] from a plain thread.
#[must_use = "a task does nothing unless its outcome is awaited or waited on"]
pub struct Task<T> {
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> Task<T> {
    /// Block the current thread until the task resolves.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<T, TaskError> {
        self.rx.blocking_recv().unwrap_or(Err(TaskError::Cancelled))
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TaskError::Cancelled)))
    }
}

/// What the executing side does with a job it pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobMode {
    Run,
    Cancel,
}

/// Type-erased job as stored in queues. Consuming it resolves its task once.
pub(crate) type Job = Box<dyn FnOnce(JobMode) + Send + 'static>;

/// Wrap `work` into a queueable job plus the task observing it.
pub(crate) fn job<F, T>(work: F) -> (Job, Task<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move |mode| {
        let outcome = match mode {
            JobMode::Run => catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref()))),
            JobMode::Cancel => Err(TaskError::Cancelled),
        };
        // Nobody listening is fine.
        let _ = tx.send(outcome);
    });
    (job, Task { rx })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

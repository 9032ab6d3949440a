//! Single-threaded FIFO task queue.
//!
//! Every submitted unit of work runs on one dedicated OS thread, one at a
//! time, in submission order. Consumers rely on this to serialize access to
//! state they share (a journal, a pool's free list).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use tracing::debug;

use crate::task::{Job, JobMode, Task, TaskError, job};

/// Lifecycle of a [`TaskQueue`]. Leaves `Operating` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting and running tasks.
    Operating,
    /// Pending tasks were aborted; the thread is gone or leaving.
    Cancelled,
    /// Pending tasks were drained; the thread is gone or leaving.
    Flushed,
}

struct Inner {
    state: QueueState,
    jobs: VecDeque<Job>,
}

struct Shared {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO queue drained by exactly one dedicated thread.
pub struct TaskQueue {
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl TaskQueue {
    /// Spawn the queue's execution thread.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: QueueState::Operating,
                jobs: VecDeque::new(),
            }),
            ready: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = std::thread::spawn(move || drain(&thread_shared));
        let worker_id = handle.thread().id();
        debug!(queue = %name, "task queue started");

        Self {
            name,
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        }
    }

    /// Queue `work` for execution. Fails at once when the queue is closed.
    pub fn submit<F, T>(&self, work: F) -> Result<Task<T>, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut inner = self.shared.lock();
        if inner.state != QueueState::Operating {
            return Err(TaskError::QueueClosed);
        }
        let (job, task) = job(work);
        inner.jobs.push_back(job);
        drop(inner);
        self.shared.ready.notify_one();
        Ok(task)
    }

    /// Stop accepting work, run everything already queued, then stop.
    ///
    /// Returns once the last queued task has resolved.
    pub fn flush(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state == QueueState::Operating {
                inner.state = QueueState::Flushed;
            }
        }
        self.shared.ready.notify_all();
        self.join();
    }

    /// Abort every queued task with [`TaskError::Cancelled`] and stop.
    ///
    /// A task already running is allowed to finish.
    pub fn cancel(&self) {
        let aborted: Vec<Job> = {
            let mut inner = self.shared.lock();
            if inner.state == QueueState::Operating {
                inner.state = QueueState::Cancelled;
                inner.jobs.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        self.shared.ready.notify_all();
        if !aborted.is_empty() {
            debug!(queue = %self.name, count = aborted.len(), "cancelling queued tasks");
        }
        for job in aborted {
            job(JobMode::Cancel);
        }
        self.join();
    }

    pub fn state(&self) -> QueueState {
        self.shared.lock().state
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn join(&self) {
        // A task flushing its own queue must not wait on itself.
        if std::thread::current().id() == self.worker_id {
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
            debug!(queue = %self.name, "task queue stopped");
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn drain(shared: &Shared) {
    loop {
        let job = {
            let mut inner = shared.lock();
            loop {
                match inner.state {
                    QueueState::Cancelled => return,
                    QueueState::Flushed => match inner.jobs.pop_front() {
                        Some(job) => break job,
                        None => return,
                    },
                    QueueState::Operating => match inner.jobs.pop_front() {
                        Some(job) => break job,
                        None => {
                            inner = shared
                                .ready
                                .wait(inner)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                    },
                }
            }
        };
        job(JobMode::Run);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_in_submission_order_one_at_a_time() {
        let queue = TaskQueue::new("order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let seen = seen.clone();
                let busy = busy.clone();
                queue
                    .submit(move || {
                        assert!(!busy.swap(true, Ordering::SeqCst), "overlapping tasks");
                        seen.lock().unwrap().push(i);
                        busy.store(false, Ordering::SeqCst);
                        i
                    })
                    .expect("submit")
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.wait(), Ok(i));
        }
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn cancel_aborts_pending_and_closes() {
        let queue = Arc::new(TaskQueue::new("cancel"));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let gate = queue
            .submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                "gate"
            })
            .expect("submit gate");
        started_rx.recv().unwrap();

        let pending: Vec<_> = (0..5)
            .map(|i| queue.submit(move || i).expect("submit"))
            .collect();

        let watcher = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.state() != QueueState::Cancelled {
                    std::thread::sleep(Duration::from_millis(1));
                }
                release_tx.send(()).unwrap();
            })
        };

        queue.cancel();
        watcher.join().unwrap();

        assert_eq!(gate.wait(), Ok("gate"));
        for task in pending {
            assert_eq!(task.wait(), Err(TaskError::Cancelled));
        }
        assert!(matches!(queue.submit(|| ()), Err(TaskError::QueueClosed)));
        assert_eq!(queue.state(), QueueState::Cancelled);
    }

    #[test]
    fn dropping_cancels_pending_tasks() {
        let queue = TaskQueue::new("drop");
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let gate = queue
            .submit(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .expect("submit gate");
        started_rx.recv().unwrap();
        let pending: Vec<_> = (0..3)
            .map(|i| queue.submit(move || i).expect("submit"))
            .collect();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
        });
        drop(queue);
        releaser.join().unwrap();

        assert_eq!(gate.wait(), Ok(()));
        for task in pending {
            assert_eq!(task.wait(), Err(TaskError::Cancelled));
        }
    }

    #[test]
    fn flush_drains_everything_before_returning() {
        let queue = TaskQueue::new("flush");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let seen = seen.clone();
            tasks.push(
                queue
                    .submit(move || {
                        std::thread::sleep(Duration::from_millis(1));
                        seen.lock().unwrap().push(i);
                    })
                    .expect("submit"),
            );
        }
        let failing = queue.submit(|| -> () { panic!("bad unit") }).expect("submit");

        queue.flush();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        for task in tasks {
            assert_eq!(task.wait(), Ok(()));
        }
        assert_eq!(failing.wait(), Err(TaskError::Panicked("bad unit".into())));
        assert!(matches!(queue.submit(|| ()), Err(TaskError::QueueClosed)));
        assert_eq!(queue.state(), QueueState::Flushed);
    }

    #[test]
    fn panic_does_not_kill_the_thread() {
        let queue = TaskQueue::new("panic");
        let bad = queue.submit(|| -> u8 { panic!("first") }).expect("submit");
        let good = queue.submit(|| 7u8).expect("submit");
        assert!(matches!(bad.wait(), Err(TaskError::Panicked(_))));
        assert_eq!(good.wait(), Ok(7));
    }

    #[test]
    fn terminal_states_never_revert() {
        let queue = TaskQueue::new("terminal");
        queue.flush();
        queue.cancel();
        assert_eq!(queue.state(), QueueState::Flushed);
    }

    #[test]
    fn flush_from_inside_a_task_does_not_deadlock() {
        let queue = Arc::new(TaskQueue::new("self-flush"));
        let inner = queue.clone();
        let task = queue.submit(move || inner.flush()).expect("submit");
        assert_eq!(task.wait(), Ok(()));
        queue.flush();
        assert_eq!(queue.state(), QueueState::Flushed);
    }

    #[tokio::test]
    async fn tasks_can_be_awaited() {
        let queue = TaskQueue::new("async");
        let task = queue.submit(|| "from queue").expect("submit");
        assert_eq!(task.await, Ok("from queue"));
    }
}

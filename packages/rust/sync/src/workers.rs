//! Scalable pool of worker threads sharing one blocking queue.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::debug;

use crate::task::{Job, JobMode, Task, job};

/// Identifier handed out by [`WorkerPool::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

struct Inner {
    jobs: VecDeque<Job>,
    /// Outstanding termination credits, never more than `live.len()`.
    credits: usize,
    /// Set by `stop_all`: every worker leaves.
    unlimited: bool,
    live: HashSet<WorkerId>,
}

struct Shared {
    inner: Mutex<Inner>,
    available: Condvar,
    active: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A growable, shrinkable set of threads pulling from one shared FIFO queue.
pub struct WorkerPool {
    name: String,
    shared: Arc<Shared>,
    handles: Mutex<Vec<(WorkerId, JoinHandle<()>)>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    /// Create an empty pool. Call [`WorkerPool::allocate`] to add workers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    jobs: VecDeque::new(),
                    credits: 0,
                    unlimited: false,
                    live: HashSet::new(),
                }),
                available: Condvar::new(),
                active: AtomicUsize::new(0),
            }),
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Create a pool with `workers` threads already running.
    pub fn with_workers(name: impl Into<String>, workers: usize) -> Self {
        let pool = Self::new(name);
        pool.batch_allocate(workers);
        pool
    }

    /// Start one more worker.
    pub fn allocate(&self) -> WorkerId {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.lock().live.insert(id);

        let shared = self.shared.clone();
        let handle = std::thread::spawn(move || work(&shared, id));

        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap threads that already left after a batch removal.
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((id, handle));
        id
    }

    pub fn batch_allocate(&self, count: usize) -> Vec<WorkerId> {
        let ids: Vec<_> = (0..count).map(|_| self.allocate()).collect();
        debug!(pool = %self.name, added = ids.len(), "workers allocated");
        ids
    }

    /// Ask `count` workers to leave. Returns how many termination credits were
    /// issued, which is at most the number of live workers.
    ///
    /// Which workers leave is unspecified.
    pub fn batch_remove(&self, count: usize) -> usize {
        let issued = {
            let mut inner = self.shared.lock();
            let removable = inner.live.len().saturating_sub(inner.credits);
            let issued = count.min(removable);
            inner.credits += issued;
            issued
        };
        for _ in 0..issued {
            self.shared.available.notify_one();
        }
        debug!(pool = %self.name, requested = count, issued, "workers removed");
        issued
    }

    /// Queue `work` for the next free worker.
    pub fn enqueue<F, T>(&self, work: F) -> Task<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, task) = job(work);
        self.shared.lock().jobs.push_back(job);
        self.shared.available.notify_one();
        task
    }

    /// Make every worker leave and join them all.
    ///
    /// With `cancel_pending`, queued tasks resolve as cancelled. Otherwise
    /// they stay queued for workers allocated later.
    pub fn stop_all(&self, cancel_pending: bool) {
        let aborted: Vec<Job> = {
            let mut inner = self.shared.lock();
            inner.unlimited = true;
            if cancel_pending {
                inner.jobs.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        self.shared.available.notify_all();
        for job in aborted {
            job(JobMode::Cancel);
        }

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let joined = handles.len();
        for (_, handle) in handles {
            let _ = handle.join();
        }

        let mut inner = self.shared.lock();
        inner.unlimited = false;
        inner.credits = 0;
        debug!(pool = %self.name, joined, "all workers stopped");
    }

    /// Workers currently alive.
    pub fn worker_count(&self) -> usize {
        self.shared.lock().live.len()
    }

    /// Workers currently executing a task (not blocked waiting for one).
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_all(true);
    }
}

fn work(shared: &Shared, id: WorkerId) {
    shared.active.fetch_add(1, Ordering::SeqCst);
    loop {
        let job = {
            let mut inner = shared.lock();
            loop {
                if inner.unlimited || inner.credits > 0 {
                    if !inner.unlimited {
                        inner.credits -= 1;
                    }
                    inner.live.remove(&id);
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                if let Some(job) = inner.jobs.pop_front() {
                    break job;
                }
                shared.active.fetch_sub(1, Ordering::SeqCst);
                inner = shared
                    .available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
                shared.active.fetch_add(1, Ordering::SeqCst);
            }
        };
        job(JobMode::Run);
    }
}

//! Resource pools handing out scoped leases.
//!
//! Three policies share the [`ResourcePool`] contract:
//! - [`LockedPool`]: unbounded, mutex-guarded free list, never blocks
//! - [`QueuedPool`]: unbounded, every borrow and return runs on a [`TaskQueue`]
//! - [`FixedPool`]: `capacity` pre-spawned instances, borrowing blocks when empty

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::queue::TaskQueue;
use crate::task::Task;

/// Failure to obtain an instance from a pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool was disposed before or while the caller waited.
    #[error("pool disposed while waiting for an instance")]
    Cancelled,
}

/// Common contract of every pool policy.
pub trait ResourcePool<T: Send + 'static>: Send + Sync {
    /// Borrow an instance, blocking if the policy requires it.
    fn borrow(&self) -> Result<Lease<T>, PoolError>;

    /// Drop all pooled instances and refuse further borrows.
    fn dispose(&self);
}

/// Where a lease sends its instance back to.
trait Recycle<T>: Send + Sync {
    fn recycle(&self, item: T);
}

/// Scoped borrow of a pooled instance. Dropping it returns the instance once.
pub struct Lease<T: Send + 'static> {
    item: Option<T>,
    home: Arc<dyn Recycle<T>>,
}

impl<T: Send + 'static> Lease<T> {
    fn new(item: T, home: Arc<dyn Recycle<T>>) -> Self {
        Self {
            item: Some(item),
            home,
        }
    }
}

impl<T: Send + 'static> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("lease accessed after release"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("lease accessed after release"),
        }
    }
}

impl<T: Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.home.recycle(item);
        }
    }
}

impl<T: Send + std::fmt::Debug + 'static> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Lease").field(&self.item).finish()
    }
}

type Spawner<T> = Arc<dyn Fn() -> T + Send + Sync>;

// ---------------------------------------------------------------------------
// LockedPool
// ---------------------------------------------------------------------------

struct LockedShared<T> {
    free: Mutex<Vec<T>>,
    spawner: Spawner<T>,
    disposed: AtomicBool,
    spawned: AtomicUsize,
}

impl<T: Send + 'static> Recycle<T> for LockedShared<T> {
    fn recycle(&self, item: T) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }
}

/// Unbounded pool guarded by a mutex; spawns on demand and never blocks.
pub struct LockedPool<T: Send + 'static> {
    shared: Arc<LockedShared<T>>,
}

impl<T: Send + 'static> LockedPool<T> {
    pub fn new(spawner: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(LockedShared {
                free: Mutex::new(Vec::new()),
                spawner: Arc::new(spawner),
                disposed: AtomicBool::new(false),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    /// Instances sitting in the free list.
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Instances created over the pool's lifetime.
    pub fn spawned(&self) -> usize {
        self.shared.spawned.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> ResourcePool<T> for LockedPool<T> {
    fn borrow(&self) -> Result<Lease<T>, PoolError> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(PoolError::Cancelled);
        }
        let reused = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let item = match reused {
            Some(item) => item,
            None => {
                self.shared.spawned.fetch_add(1, Ordering::SeqCst);
                (self.shared.spawner)()
            }
        };
        Ok(Lease::new(item, self.shared.clone()))
    }

    fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ---------------------------------------------------------------------------
// QueuedPool
// ---------------------------------------------------------------------------

struct QueuedShared<T> {
    queue: TaskQueue,
    free: Arc<Mutex<Vec<T>>>,
    spawner: Spawner<T>,
}

impl<T: Send + 'static> QueuedShared<T> {
    fn take(&self) -> Result<Task<T>, PoolError> {
        let free = self.free.clone();
        let spawner = self.spawner.clone();
        self.queue
            .submit(move || {
                let reused = free.lock().unwrap_or_else(PoisonError::into_inner).pop();
                reused.unwrap_or_else(|| spawner())
            })
            .map_err(|_| PoolError::Cancelled)
    }
}

impl<T: Send + 'static> Recycle<T> for QueuedShared<T> {
    fn recycle(&self, item: T) {
        let free = self.free.clone();
        // A closed queue drops the job, and the instance with it.
        let _ = self.queue.submit(move || {
            free.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item);
        });
    }
}

/// Unbounded pool whose borrows and returns are serialized on a task queue,
/// so spawning and releasing never race with disposal.
pub struct QueuedPool<T: Send + 'static> {
    shared: Arc<QueuedShared<T>>,
}

impl<T: Send + 'static> QueuedPool<T> {
    pub fn new(name: &str, spawner: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(QueuedShared {
                queue: TaskQueue::new(format!("{name}-pool")),
                free: Arc::new(Mutex::new(Vec::new())),
                spawner: Arc::new(spawner),
            }),
        }
    }

    /// Async borrow for callers running on a tokio runtime.
    pub async fn acquire(&self) -> Result<Lease<T>, PoolError> {
        let item = self
            .shared
            .take()?
            .await
            .map_err(|_| PoolError::Cancelled)?;
        Ok(Lease::new(item, self.shared.clone()))
    }

    /// Instances sitting in the free list.
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: Send + 'static> ResourcePool<T> for QueuedPool<T> {
    fn borrow(&self) -> Result<Lease<T>, PoolError> {
        let item = self
            .shared
            .take()?
            .wait()
            .map_err(|_| PoolError::Cancelled)?;
        Ok(Lease::new(item, self.shared.clone()))
    }

    fn dispose(&self) {
        let free = self.shared.free.clone();
        let _ = self.shared.queue.submit(move || {
            free.lock().unwrap_or_else(PoisonError::into_inner).clear();
        });
        self.shared.queue.flush();
    }
}

// ---------------------------------------------------------------------------
// FixedPool
// ---------------------------------------------------------------------------

struct Slots<T> {
    free: Vec<T>,
    disposed: bool,
}

struct FixedShared<T> {
    slots: Mutex<Slots<T>>,
    returned: Condvar,
    notify: Notify,
    capacity: usize,
}

impl<T> FixedShared<T> {
    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> Recycle<T> for FixedShared<T> {
    fn recycle(&self, item: T) {
        {
            let mut slots = self.lock();
            if slots.disposed {
                return;
            }
            slots.free.push(item);
        }
        self.returned.notify_one();
        self.notify.notify_one();
    }
}

/// Fixed set of `capacity` instances. Borrowing blocks while all are leased.
pub struct FixedPool<T: Send + 'static> {
    shared: Arc<FixedShared<T>>,
}

impl<T: Send + 'static> FixedPool<T> {
    /// Pre-spawn `capacity` instances.
    pub fn new(capacity: usize, spawner: impl Fn() -> T) -> Self {
        Self::from_instances((0..capacity).map(|_| spawner()).collect())
    }

    /// Pool exactly these instances; the capacity is their count.
    pub fn from_instances(instances: Vec<T>) -> Self {
        let capacity = instances.len();
        Self {
            shared: Arc::new(FixedShared {
                slots: Mutex::new(Slots {
                    free: instances,
                    disposed: false,
                }),
                returned: Condvar::new(),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    /// Borrow without waiting. `Ok(None)` when every instance is leased.
    pub fn try_borrow(&self) -> Result<Option<Lease<T>>, PoolError> {
        let mut slots = self.shared.lock();
        if slots.disposed {
            return Err(PoolError::Cancelled);
        }
        Ok(slots
            .free
            .pop()
            .map(|item| Lease::new(item, self.shared.clone())))
    }

    /// Async borrow: parks the task, not the thread, while the pool is empty.
    pub async fn acquire(&self) -> Result<Lease<T>, PoolError> {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(lease) = self.try_borrow()? {
                return Ok(lease);
            }
            notified.await;
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Instances currently available, in `[0, capacity]`.
    pub fn available(&self) -> usize {
        self.shared.lock().free.len()
    }
}

impl<T: Send + 'static> ResourcePool<T> for FixedPool<T> {
    fn borrow(&self) -> Result<Lease<T>, PoolError> {
        let mut slots = self.shared.lock();
        loop {
            if slots.disposed {
                return Err(PoolError::Cancelled);
            }
            if let Some(item) = slots.free.pop() {
                return Ok(Lease::new(item, self.shared.clone()));
            }
            slots = self
                .shared
                .returned
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn dispose(&self) {
        {
            let mut slots = self.shared.lock();
            slots.disposed = true;
            slots.free.clear();
        }
        self.shared.returned.notify_all();
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn locked_pool_reuses_returned_instances() {
        let pool = LockedPool::new(Vec::<u8>::new);
        {
            let mut a = pool.borrow().unwrap();
            a.push(1);
            let _b = pool.borrow().unwrap();
            assert_eq!(pool.spawned(), 2);
        }
        assert_eq!(pool.idle(), 2);

        let again = pool.borrow().unwrap();
        assert_eq!(pool.spawned(), 2);
        drop(again);

        pool.dispose();
        assert_eq!(pool.idle(), 0);
        assert!(matches!(pool.borrow(), Err(PoolError::Cancelled)));
    }

    #[test]
    fn lease_returns_even_on_panic() {
        let pool = Arc::new(FixedPool::new(1, || 0u32));
        let inner = pool.clone();
        let result = std::thread::spawn(move || {
            let _lease = inner.borrow().unwrap();
            panic!("holder died");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn queued_pool_serializes_through_its_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let spawn_counter = counter.clone();
        let pool = QueuedPool::new("test", move || spawn_counter.fetch_add(1, Ordering::SeqCst));

        let first = pool.borrow().unwrap();
        assert_eq!(*first, 0);
        drop(first);

        // The return is queued before the next take, so the instance is reused.
        let second = pool.borrow().unwrap();
        assert_eq!(*second, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        drop(second);

        pool.dispose();
        assert!(matches!(pool.borrow(), Err(PoolError::Cancelled)));
    }

    #[tokio::test]
    async fn queued_pool_async_acquire() {
        let pool = QueuedPool::new("async", || String::from("client"));
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.as_str(), "client");
    }

    #[test]
    fn fixed_pool_never_exceeds_capacity() {
        let pool = Arc::new(FixedPool::new(3, || ()));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let pool = pool.clone();
                let live = live.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    let _lease = pool.borrow().unwrap();
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    live.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn fixed_pool_blocks_until_one_is_returned() {
        let pool = Arc::new(FixedPool::new(2, || ()));
        let a = pool.borrow().unwrap();
        let b = pool.borrow().unwrap();
        assert!(pool.try_borrow().unwrap().is_none());

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let lease = pool.borrow().unwrap();
                tx.send(()).unwrap();
                drop(lease);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(a);
        rx.recv_timeout(Duration::from_secs(5)).expect("waiter woke up");
        waiter.join().unwrap();
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn dispose_wakes_blocked_borrowers_with_cancellation() {
        let pool = Arc::new(FixedPool::new(1, || ()));
        let held = pool.borrow().unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.borrow().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.dispose();

        assert_eq!(waiter.join().unwrap(), Err(PoolError::Cancelled));
        drop(held);
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn fixed_pool_async_acquire_waits_for_return() {
        let pool = Arc::new(FixedPool::from_instances(vec![7u8]));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn fixed_pool_async_dispose_cancels_waiters() {
        let pool = Arc::new(FixedPool::from_instances(vec![()]));
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.dispose();
        assert_eq!(waiter.await.unwrap(), Err(PoolError::Cancelled));
    }
}

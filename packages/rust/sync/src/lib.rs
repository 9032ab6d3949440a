//! Concurrency primitives for Newsdesk.
//!
//! - [`TaskQueue`]: one thread, FIFO, one task at a time
//! - [`WorkerPool`]: many threads over one shared queue, resizable
//! - [`LockedPool`], [`QueuedPool`], [`FixedPool`]: leased resource pools
//! - [`Choker`]: semaphore bounding concurrent calls to an external stage
//! - [`Daemon`]: periodic sleep/iterate loop with cooperative stop

pub mod choker;
pub mod daemon;
pub mod pool;
pub mod queue;
pub mod task;
pub mod workers;

pub use choker::{Choker, ChokerPermit};
pub use daemon::{Daemon, DaemonState, Iterate, MAX_DAEMON_INTERVAL};
pub use pool::{FixedPool, Lease, LockedPool, PoolError, QueuedPool, ResourcePool};
pub use queue::{QueueState, TaskQueue};
pub use task::{Task, TaskError};
pub use workers::{WorkerId, WorkerPool};

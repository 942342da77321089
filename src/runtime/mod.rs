//! Task execution.
//!
//! This module contains the machinery every monitor loop and deferred signal
//! runs on:
//!
//! - [`worker_pool`]: Elastic OS-thread pool with idle retirement
//! - [`task`]: Spawned tasks, [`TaskHandle`], [`TaskStatus`] and the
//!   object-safe [`TaskCompletion`] view
//! - [`block_on`]: Drive a future to completion on the current thread
//!
//! # Scheduling Model
//!
//! Suspension is cooperative and backed by an arbitrary thread pool: a task
//! may resume on a different thread than the one it suspended on. There is
//! one process-wide executor pool, created on first use from
//! [`config::global`](crate::config::global). Work items queued through
//! [`defer`] share that pool.
//!
//! # Example
//!
//! ```ignore
//! use cordon::runtime::{block_on, spawn};
//!
//! let handle = spawn(async { Ok(1 + 1) });
//! assert_eq!(block_on(handle)?, 2);
//! ```

pub mod task;
pub mod worker_pool;

mod block_on;

pub use block_on::block_on;
pub use task::{TaskCompletion, TaskHandle, TaskRef, TaskStatus};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

use std::future::Future;
use std::sync::OnceLock;

use crate::error::Result;

static EXECUTOR: OnceLock<WorkerPool> = OnceLock::new();

/// Returns the process-wide executor pool.
pub fn executor() -> &'static WorkerPool {
    EXECUTOR.get_or_init(|| {
        let config = crate::config::global();
        let pool = WorkerPool::new(config.executor.pool_config(&config.thread_name_prefix));
        tracing::debug!(
            min_threads = config.executor.min_threads,
            max_threads = config.executor.max_threads,
            "executor pool started"
        );
        pool
    })
}

/// Spawns a task on the process-wide executor.
pub fn spawn<F, T>(future: F) -> TaskHandle<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_on(executor(), future)
}

/// Spawns a task whose result nobody awaits.
///
/// A failure is logged at `warn`; register the task with an
/// [`ErrorQueue`](crate::error::ErrorQueue) to surface it instead.
pub fn spawn_detached<F>(future: F) -> TaskRef
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let handle = spawn(async move {
        let result = future.await;
        if let Err(err) = &result {
            if !err.is_cancelled() {
                tracing::warn!(error = %err, "detached task failed");
            }
        }
        result
    });
    handle.task_ref()
}

/// Queues a closure onto the background work queue.
///
/// Used for soft signals, so a signal that triggers further signals does not
/// deepen the caller's stack.
pub fn defer<F>(work: F)
where
    F: FnOnce() + Send + 'static,
{
    executor().execute(work);
}

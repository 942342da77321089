//! Elastic pool of OS threads for short work items.
//!
//! The pool backs both the task executor and the delay scheduler's gate
//! firing. It supports:
//!
//! - **Elastic sizing**: threads are spawned lazily when work arrives and no
//!   parked thread is available, up to `max_threads`
//! - **Idle retirement**: threads above `min_threads` exit after parking for
//!   `idle_timeout` with nothing to do
//! - **Panic isolation**: a panicking work item is logged and the thread
//!   keeps serving the queue
//!
//! # Thread Lifecycle
//!
//! Idle threads park on a condition variable. A submitter that finds a
//! parked thread claims a wakeup for it; if every thread is busy and the pool
//! is below its limit, a new thread is spawned instead. Claimed wakeups are
//! counted under the pool mutex so a notification is never lost between a
//! thread deciding to park and actually parking.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Settings for a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Minimum number of threads kept alive once spawned.
    pub min_threads: usize,
    /// Maximum number of threads.
    pub max_threads: usize,
    /// Idle time before a thread above `min_threads` retires.
    pub idle_timeout: Duration,
    /// Thread name stem; threads are named `{thread_name}-{n}`.
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: 4,
            idle_timeout: Duration::from_secs(10),
            thread_name: "cordon-pool".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Live threads.
    active: usize,
    /// Threads parked on the condvar.
    idle: usize,
    /// Wakeups claimed by submitters but not yet consumed by a parked thread.
    wakeups: usize,
}

struct PoolInner {
    config: WorkerPoolConfig,
    queue: SegQueue<Job>,
    state: Mutex<PoolState>,
    condvar: Condvar,
    busy: AtomicUsize,
    completed: AtomicU64,
    spawned: AtomicU64,
    shutdown: AtomicBool,
}

/// A cloneable handle to an elastic worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.config.thread_name)
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool and eagerly spawns `min_threads` threads.
    #[must_use]
    pub fn new(mut config: WorkerPoolConfig) -> Self {
        config.max_threads = config.max_threads.max(1);
        config.min_threads = config.min_threads.min(config.max_threads);
        let min = config.min_threads;
        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                queue: SegQueue::new(),
                state: Mutex::new(PoolState::default()),
                condvar: Condvar::new(),
                busy: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
                spawned: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        };
        {
            let mut state = pool.inner.state.lock();
            for _ in 0..min {
                spawn_thread(&pool.inner, &mut state);
            }
        }
        pool
    }

    /// Queues a work item.
    ///
    /// Items submitted after [`shutdown`](Self::shutdown) are dropped.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            tracing::debug!(pool = %self.inner.config.thread_name, "work submitted after shutdown dropped");
            return;
        }
        self.inner.queue.push(Box::new(job));

        let mut state = self.inner.state.lock();
        if state.idle > state.wakeups {
            state.wakeups += 1;
            self.inner.condvar.notify_one();
        } else if state.active < self.inner.config.max_threads {
            spawn_thread(&self.inner, &mut state);
        }
    }

    /// Returns the number of live threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Returns the number of threads currently running a work item.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Returns the number of queued work items.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.queue.len()
    }

    /// Returns the number of work items run to completion (or panic).
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Returns how many threads this pool has spawned over its lifetime.
    #[must_use]
    pub fn threads_spawned(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    /// Stops accepting work. Queued items still run; threads exit once the
    /// queue is drained.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _state = self.inner.state.lock();
        self.inner.condvar.notify_all();
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

/// Spawns one thread. Must be called with the state lock held.
fn spawn_thread(inner: &Arc<PoolInner>, state: &mut PoolState) {
    let id = inner.spawned.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{id}", inner.config.thread_name);
    let worker = Arc::clone(inner);
    match thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(&worker))
    {
        Ok(_) => {
            state.active += 1;
            tracing::debug!(thread = %name, active = state.active, "worker thread spawned");
        }
        Err(err) => {
            tracing::warn!(thread = %name, error = %err, "failed to spawn worker thread");
        }
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.busy.fetch_add(1, Ordering::Relaxed);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                let err = crate::error::Error::from_panic(payload.as_ref());
                tracing::warn!(pool = %inner.config.thread_name, error = %err, "work item panicked");
            }
            inner.busy.fetch_sub(1, Ordering::Relaxed);
            inner.completed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let mut state = inner.state.lock();
        if !inner.queue.is_empty() {
            continue;
        }
        if inner.shutdown.load(Ordering::Acquire) {
            state.active -= 1;
            return;
        }

        state.idle += 1;
        loop {
            let timed_out = inner
                .condvar
                .wait_for(&mut state, inner.config.idle_timeout)
                .timed_out();
            if state.wakeups > 0 {
                state.wakeups -= 1;
                state.idle -= 1;
                break;
            }
            if inner.shutdown.load(Ordering::Acquire) {
                state.idle -= 1;
                break;
            }
            if timed_out && inner.queue.is_empty() && state.active > inner.config.min_threads {
                state.idle -= 1;
                state.active -= 1;
                tracing::debug!(
                    pool = %inner.config.thread_name,
                    active = state.active,
                    "idle worker thread retired"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, wait_until};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn pool(min: usize, max: usize, idle_ms: u64) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig {
            min_threads: min,
            max_threads: max,
            idle_timeout: Duration::from_millis(idle_ms),
            thread_name: "test-pool".to_string(),
        })
    }

    #[test]
    fn runs_submitted_work() {
        init_test("runs_submitted_work");
        let pool = pool(0, 2, 1000);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let c = Arc::clone(&counter);
            pool.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let done = wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 16);
        crate::assert_with_log!(done, "all work ran", 16usize, counter.load(Ordering::SeqCst));
        assert!(pool.threads_spawned() <= 2);
        crate::test_complete!("runs_submitted_work");
    }

    #[test]
    fn grows_when_all_threads_busy() {
        init_test("grows_when_all_threads_busy");
        let pool = pool(0, 4, 1000);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));
        let started = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let rx = Arc::clone(&release_rx);
            let started = Arc::clone(&started);
            pool.execute(move || {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = rx.lock().map(|rx| rx.recv());
            });
        }

        // The first item holds the receiver lock, the others block on it,
        // so three threads must exist to start all three.
        let grew = wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 3);
        crate::assert_with_log!(grew, "pool grew to three threads", 3usize, pool.active_threads());
        for _ in 0..3 {
            let _ = release_tx.send(());
        }
        crate::test_complete!("grows_when_all_threads_busy");
    }

    #[test]
    fn idle_threads_retire_above_min() {
        init_test("idle_threads_retire_above_min");
        let pool = pool(0, 2, 20);
        pool.execute(|| {});
        let retired = wait_until(Duration::from_secs(5), || {
            pool.completed() == 1 && pool.active_threads() == 0
        });
        crate::assert_with_log!(retired, "thread retired", 0usize, pool.active_threads());
        crate::test_complete!("idle_threads_retire_above_min");
    }

    #[test]
    fn panicking_job_keeps_thread_alive() {
        init_test("panicking_job_keeps_thread_alive");
        let pool = pool(1, 1, 1000);
        pool.execute(|| panic!("job failure"));
        let (tx, rx) = mpsc::channel();
        pool.execute(move || {
            let _ = tx.send(7);
        });
        let value = rx.recv_timeout(Duration::from_secs(5)).ok();
        crate::assert_with_log!(value == Some(7), "second job ran", Some(7), value);
        assert_eq!(pool.threads_spawned(), 1);
        crate::test_complete!("panicking_job_keeps_thread_alive");
    }

    #[test]
    fn shutdown_drops_new_work() {
        init_test("shutdown_drops_new_work");
        let pool = pool(1, 1, 1000);
        pool.shutdown();
        assert!(pool.is_shutdown());
        let hit = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hit);
        pool.execute(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hit.load(Ordering::SeqCst), 0);
        crate::test_complete!("shutdown_drops_new_work");
    }
}

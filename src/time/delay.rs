//! Precise delay scheduler.
//!
//! Many concurrent `delay(ms)` requests are served by one sorted map of
//! millisecond deadlines and one dedicated timer thread, instead of one OS
//! timer per request.
//!
//! # Design
//!
//! - A request computes `target = ceil(now_ms) + ms` and attaches to the
//!   [`AsyncGate`] stored under `target`, creating it if absent. Requests that
//!   land on the same millisecond share one gate. The gate is level
//!   triggered, so every coalesced waiter is released.
//! - The timer thread removes every entry with `target <= now`, hands each
//!   gate's `set_now` to an elastic [`WorkerPool`], then sleeps until the next
//!   deadline or the polling ceiling, whichever is sooner.
//! - Inserting a deadline earlier than the current head wakes the timer
//!   thread immediately.
//!
//! # Lifecycle
//!
//! [`DelayScheduler::global`] lives from first use to process exit. Instances
//! built with [`DelayScheduler::new`] stop their timer thread when the last
//! handle is dropped; gates still pending at that point never fire.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use super::clock::{TimeSource, WallClock};
use crate::config::DelayConfig;
use crate::observability::SchedulerMetrics;
use crate::runtime::WorkerPool;
use crate::sync::{AsyncGate, GateWait};
use crate::types::Time;

/// Sentinel millisecond count meaning "never".
pub const INFINITE: i64 = -1;

/// Something that can produce millisecond delays.
///
/// Components that wait on time take a `Delayer` so tests can substitute an
/// isolated scheduler driven by a [`VirtualClock`](super::VirtualClock).
pub trait Delayer: Send + Sync {
    /// Returns a future resolving after `ms` milliseconds.
    ///
    /// `ms <= 0` resolves immediately, except [`INFINITE`] which never
    /// resolves.
    fn delay(&self, ms: i64) -> Delay;

    /// Returns the clock reading the delays are measured against.
    fn now(&self) -> Time;
}

/// Future returned by [`delay`] and [`Delayer::delay`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Delay {
    state: DelayState,
}

#[derive(Debug)]
enum DelayState {
    Elapsed,
    Never,
    Waiting(GateWait),
}

impl Delay {
    /// A delay that has already elapsed.
    pub fn elapsed() -> Self {
        Self {
            state: DelayState::Elapsed,
        }
    }

    /// A delay that never elapses.
    pub fn never() -> Self {
        Self {
            state: DelayState::Never,
        }
    }

    /// Returns true if this delay can never resolve.
    #[must_use]
    pub fn is_never(&self) -> bool {
        matches!(self.state, DelayState::Never)
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.state {
            DelayState::Elapsed => Poll::Ready(()),
            DelayState::Never => Poll::Pending,
            DelayState::Waiting(wait) => Pin::new(wait).poll(cx),
        }
    }
}

struct SchedulerInner {
    clock: Arc<dyn TimeSource>,
    config: DelayConfig,
    deadlines: Mutex<BTreeMap<u64, AsyncGate>>,
    wake: Condvar,
    pool: WorkerPool,
    shutdown: AtomicBool,
    timer_running: AtomicBool,
    requests: AtomicU64,
    coalesced: AtomicU64,
    fired: AtomicU64,
}

impl SchedulerInner {
    fn now_ms_ceil(&self) -> u64 {
        let nanos = self.clock.now().as_nanos();
        nanos.div_ceil(1_000_000)
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().as_millis()
    }

    /// Removes every deadline at or before `now` and fires its gate.
    fn fire_due(&self, deadlines: &mut MutexGuard<'_, BTreeMap<u64, AsyncGate>>) -> usize {
        let now = self.now_ms();
        let later = deadlines.split_off(&now.saturating_add(1));
        let due = std::mem::replace(&mut **deadlines, later);
        let count = due.len();
        if count > 0 {
            MutexGuard::unlocked(deadlines, || {
                for (_, gate) in due {
                    self.pool.execute(move || {
                        gate.set_now();
                    });
                }
            });
            self.fired.fetch_add(count as u64, Ordering::Relaxed);
            tracing::trace!(now_ms = now, fired = count, "delay deadlines fired");
        }
        count
    }

    /// One timer iteration: fire what is due, then sleep until the next
    /// deadline or the polling ceiling.
    fn run_once(&self) {
        let mut deadlines = self.deadlines.lock();
        self.fire_due(&mut deadlines);
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let now = self.now_ms();
        let sleep = deadlines.keys().next().map_or(self.config.poll_ceiling, |&next| {
            Duration::from_millis(next.saturating_sub(now)).min(self.config.poll_ceiling)
        });
        if !sleep.is_zero() {
            self.wake.wait_for(&mut deadlines, sleep);
        }
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// Serves millisecond delays from one sorted deadline map.
///
/// Handles are cheap to clone.
#[derive(Clone)]
pub struct DelayScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for DelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayScheduler")
            .field("pending", &self.inner.deadlines.lock().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl DelayScheduler {
    /// Creates a scheduler with its own timer thread and worker pool.
    #[must_use]
    pub fn new(clock: Arc<dyn TimeSource>, config: DelayConfig) -> Self {
        Self::new_named(clock, config, &crate::config::global().thread_name_prefix)
    }

    fn new_named(clock: Arc<dyn TimeSource>, config: DelayConfig, prefix: &str) -> Self {
        let scheduler = Self::manual_named(clock, config, prefix);
        scheduler.start_timer(prefix);
        scheduler
    }

    /// Creates a scheduler with no timer thread.
    ///
    /// Deadlines fire only when [`tick`](Self::tick) is called. Intended for
    /// tests driving a [`VirtualClock`](super::VirtualClock).
    #[must_use]
    pub fn manual(clock: Arc<dyn TimeSource>, config: DelayConfig) -> Self {
        Self::manual_named(clock, config, &crate::config::global().thread_name_prefix)
    }

    fn manual_named(clock: Arc<dyn TimeSource>, mut config: DelayConfig, prefix: &str) -> Self {
        config.normalize();
        let pool = WorkerPool::new(config.pool_config(prefix));
        Self {
            inner: Arc::new(SchedulerInner {
                clock,
                config,
                deadlines: Mutex::new(BTreeMap::new()),
                wake: Condvar::new(),
                pool,
                shutdown: AtomicBool::new(false),
                timer_running: AtomicBool::new(false),
                requests: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
                fired: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the process-wide scheduler, starting it on first use.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<DelayScheduler> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = crate::config::global();
            Self::new_named(
                Arc::new(WallClock::new()),
                config.delay.clone(),
                &config.thread_name_prefix,
            )
        })
    }

    fn start_timer(&self, prefix: &str) {
        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let name = format!("{prefix}-delay-timer");
        let spawned = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&weak));
        match spawned {
            Ok(_) => {
                self.inner.timer_running.store(true, Ordering::Release);
                tracing::debug!(
                    thread = %name,
                    poll_ceiling_ms = self.inner.config.poll_ceiling.as_millis() as u64,
                    "delay scheduler started"
                );
            }
            Err(err) => {
                tracing::error!(thread = %name, error = %err, "failed to start delay timer thread");
            }
        }
    }

    /// Returns a future resolving after `ms` milliseconds.
    pub fn delay(&self, ms: i64) -> Delay {
        if ms == INFINITE {
            return Delay::never();
        }
        if ms <= 0 {
            return Delay::elapsed();
        }
        let inner = &self.inner;
        inner.requests.fetch_add(1, Ordering::Relaxed);
        let target = inner.now_ms_ceil().saturating_add(ms as u64);

        let mut deadlines = inner.deadlines.lock();
        let head = deadlines.keys().next().copied();
        let gate = if let Some(gate) = deadlines.get(&target) {
            inner.coalesced.fetch_add(1, Ordering::Relaxed);
            gate.clone()
        } else {
            let gate = AsyncGate::new();
            deadlines.insert(target, gate.clone());
            gate
        };
        let wait = gate.wait();
        drop(deadlines);

        if head.map_or(true, |head| target < head) {
            inner.wake.notify_one();
        }
        Delay {
            state: DelayState::Waiting(wait),
        }
    }

    /// Fires every deadline that is due now. Returns how many gates fired.
    ///
    /// The timer thread does this on its own; manual schedulers rely on it.
    pub fn tick(&self) -> usize {
        let mut deadlines = self.inner.deadlines.lock();
        self.inner.fire_due(&mut deadlines)
    }

    /// Returns a snapshot of scheduler counters.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        let (pending_deadlines, pending_waiters, next_deadline_ms) = {
            let deadlines = self.inner.deadlines.lock();
            (
                deadlines.len(),
                deadlines.values().map(AsyncGate::waiter_count).sum(),
                deadlines.keys().next().copied(),
            )
        };
        SchedulerMetrics {
            pending_deadlines,
            pending_waiters,
            next_deadline_ms,
            now_ms: self.inner.now_ms(),
            requests: self.inner.requests.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            fired: self.inner.fired.load(Ordering::Relaxed),
            timer_running: self.inner.timer_running.load(Ordering::Acquire),
            workers_active: self.inner.pool.active_threads(),
            workers_busy: self.inner.pool.busy_threads(),
            workers_spawned: self.inner.pool.threads_spawned(),
        }
    }

    /// Stops the timer thread. Pending deadlines never fire.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _deadlines = self.inner.deadlines.lock();
        self.inner.wake.notify_all();
    }
}

impl Delayer for DelayScheduler {
    fn delay(&self, ms: i64) -> Delay {
        Self::delay(self, ms)
    }

    fn now(&self) -> Time {
        self.inner.clock.now()
    }
}

/// Asks the OS to run the calling thread at its highest priority.
///
/// Returns false if the request was refused; the caller keeps running at
/// its current priority.
fn request_max_priority() -> bool {
    match thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max) {
        Ok(()) => {
            tracing::debug!("delay timer running at max priority");
            true
        }
        Err(err) => {
            tracing::warn!(error = ?err, "delay timer priority request refused");
            false
        }
    }
}

fn timer_loop(weak: &Weak<SchedulerInner>) {
    request_max_priority();
    loop {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.shutdown.load(Ordering::Acquire) {
            inner.timer_running.store(false, Ordering::Release);
            break;
        }
        inner.run_once();
    }
    tracing::debug!("delay scheduler stopped");
}

/// Waits `ms` milliseconds on the process-wide scheduler.
///
/// `ms <= 0` resolves immediately; [`INFINITE`] never resolves.
pub fn delay(ms: i64) -> Delay {
    DelayScheduler::global().delay(ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, poll_once, wait_until};
    use crate::time::VirtualClock;

    #[test]
    fn refused_priority_request_is_not_fatal() {
        init_test("refused_priority_request_is_not_fatal");
        let granted = std::thread::spawn(request_max_priority)
            .join()
            .expect("priority request must not panic");
        tracing::info!(granted, "priority request answered");

        let scheduler = DelayScheduler::new(Arc::new(WallClock::new()), DelayConfig::default());
        let timer_up = wait_until(Duration::from_secs(5), || {
            scheduler.inner.timer_running.load(Ordering::Acquire)
        });
        crate::assert_with_log!(timer_up, "timer thread running", true, timer_up);
        crate::runtime::block_on(scheduler.delay(20));
        scheduler.shutdown();
        crate::test_complete!("refused_priority_request_is_not_fatal");
    }

    fn manual() -> (Arc<VirtualClock>, DelayScheduler) {
        let clock = Arc::new(VirtualClock::new());
        let scheduler = DelayScheduler::manual(clock.clone(), DelayConfig::default());
        (clock, scheduler)
    }

    #[test]
    fn non_positive_and_infinite_short_circuit() {
        init_test("non_positive_and_infinite_short_circuit");
        let (_clock, scheduler) = manual();
        assert!(poll_once(&mut scheduler.delay(0)).is_ready());
        assert!(poll_once(&mut scheduler.delay(-5)).is_ready());
        let mut never = scheduler.delay(INFINITE);
        assert!(never.is_never());
        assert!(poll_once(&mut never).is_pending());
        assert_eq!(scheduler.metrics().requests, 0);
        crate::test_complete!("non_positive_and_infinite_short_circuit");
    }

    #[test]
    fn deadline_fires_only_once_due() {
        init_test("deadline_fires_only_once_due");
        let (clock, scheduler) = manual();
        let mut fut = scheduler.delay(50);
        assert!(poll_once(&mut fut).is_pending());

        clock.advance_millis(49);
        assert_eq!(scheduler.tick(), 0);
        assert!(poll_once(&mut fut).is_pending());

        clock.advance_millis(1);
        assert_eq!(scheduler.tick(), 1);
        let fired = wait_until(Duration::from_secs(5), || poll_once(&mut fut).is_ready());
        crate::assert_with_log!(fired, "delay resolved at target", true, fired);
        assert_eq!(scheduler.metrics().pending_deadlines, 0);
        crate::test_complete!("deadline_fires_only_once_due");
    }

    #[test]
    fn coalesced_deadline_releases_every_waiter() {
        init_test("coalesced_deadline_releases_every_waiter");
        let (clock, scheduler) = manual();
        let mut first = scheduler.delay(30);
        let mut second = scheduler.delay(30);
        assert!(poll_once(&mut first).is_pending());
        assert!(poll_once(&mut second).is_pending());

        let metrics = scheduler.metrics();
        crate::assert_with_log!(
            metrics.pending_deadlines == 1 && metrics.coalesced == 1,
            "requests share one gate",
            (1usize, 1u64),
            (metrics.pending_deadlines, metrics.coalesced)
        );
        assert_eq!(metrics.pending_waiters, 2);

        clock.advance_to(Time::from_millis(30));
        scheduler.tick();
        let both = wait_until(Duration::from_secs(5), || {
            poll_once(&mut first).is_ready() & poll_once(&mut second).is_ready()
        });
        crate::assert_with_log!(both, "both coalesced waiters woke", true, both);
        crate::test_complete!("coalesced_deadline_releases_every_waiter");
    }

    #[test]
    fn timer_thread_fires_real_deadlines() {
        init_test("timer_thread_fires_real_deadlines");
        let scheduler = DelayScheduler::new(Arc::new(WallClock::new()), DelayConfig::default());
        let start = std::time::Instant::now();
        crate::runtime::block_on(scheduler.delay(40));
        let elapsed = start.elapsed();
        crate::assert_with_log!(
            elapsed >= Duration::from_millis(40),
            "never early",
            Duration::from_millis(40),
            elapsed
        );
        assert!(scheduler.metrics().timer_running);
        scheduler.shutdown();
        crate::test_complete!("timer_thread_fires_real_deadlines");
    }
}

//! Renewable dead-man's switch.
//!
//! A [`TimeoutDetector`] expects [`keep`](TimeoutDetector::keep) to be called
//! at least once per interval. When an interval passes without one, the
//! optional `on_timeout` callback decides: `true` grants a reprieve (as if
//! `keep` had been called), anything else confirms the timeout. A confirmed
//! timeout sets [`is_timed_out`](TimeoutDetector::is_timed_out), cancels the
//! attached [`CancelWatcher`] and signals the attached events.
//!
//! Halting the detector by disposal also signals the attached watcher and
//! events, but leaves `is_timed_out` false.
//!
//! An [`INFINITE`](crate::time::INFINITE) interval (or any negative one) makes the detector a permanent no-op: no loop is
//! started and it never times out.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::CancelWatcher;
use crate::cleanup::{AsyncCleanup, CleanupFuture, CleanupGraph, CleanupState, Dispose};
use crate::combinator::{ExceptionPolicy, WaitObjects};
use crate::error::Error;
use crate::runtime::TaskRef;
use crate::sync::{AsyncGate, AsyncPulse};
use crate::time::{DelayScheduler, Delayer};
use crate::types::{CancelReason, Time};

type TimeoutCallback = Box<dyn FnMut() -> bool + Send>;

/// Builder for a [`TimeoutDetector`].
pub struct TimeoutDetectorBuilder {
    interval_ms: i64,
    watcher: Option<CancelWatcher>,
    pulses: Vec<AsyncPulse>,
    gates: Vec<AsyncGate>,
    on_timeout: Option<TimeoutCallback>,
    delayer: Option<Arc<dyn Delayer>>,
    parent: Option<CleanupGraph>,
}

impl fmt::Debug for TimeoutDetectorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutDetectorBuilder")
            .field("interval_ms", &self.interval_ms)
            .field("watcher", &self.watcher.is_some())
            .field("pulses", &self.pulses.len())
            .field("gates", &self.gates.len())
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

impl TimeoutDetectorBuilder {
    /// Starts a builder for a detector with the given interval.
    #[must_use]
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms,
            watcher: None,
            pulses: Vec::new(),
            gates: Vec::new(),
            on_timeout: None,
            delayer: None,
            parent: None,
        }
    }

    /// Cancels `watcher` on timeout.
    #[must_use]
    pub fn watcher(mut self, watcher: CancelWatcher) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Signals `pulse` on timeout.
    #[must_use]
    pub fn pulse(mut self, pulse: AsyncPulse) -> Self {
        self.pulses.push(pulse);
        self
    }

    /// Sets `gate` on timeout.
    #[must_use]
    pub fn gate(mut self, gate: AsyncGate) -> Self {
        self.gates.push(gate);
        self
    }

    /// Consulted when an interval elapses; returning true grants a reprieve.
    #[must_use]
    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.on_timeout = Some(Box::new(callback));
        self
    }

    /// Measures intervals with `delayer` instead of the process-wide
    /// scheduler.
    #[must_use]
    pub fn delayer(mut self, delayer: Arc<dyn Delayer>) -> Self {
        self.delayer = Some(delayer);
        self
    }

    /// Registers the detector with `parent` for teardown.
    #[must_use]
    pub fn parent(mut self, parent: &CleanupGraph) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Builds the detector and starts its monitor loop. The first deadline
    /// is one interval from now.
    #[must_use]
    pub fn start(self) -> TimeoutDetector {
        let delayer: Arc<dyn Delayer> = match self.delayer {
            Some(delayer) => delayer,
            None => Arc::new(DelayScheduler::global().clone()),
        };
        let inner = Arc::new(DetectorInner {
            interval_ms: self.interval_ms,
            deadline_ns: AtomicU64::new(0),
            timed_out: AtomicBool::new(false),
            halt: AsyncGate::new(),
            delayer,
            cleanup: CleanupState::new("TimeoutDetector"),
            monitor: Mutex::new(None),
        });
        let detector = TimeoutDetector { inner };
        detector.keep();

        if self.interval_ms >= 0 {
            let targets = Targets {
                watcher: self.watcher,
                pulses: self.pulses,
                gates: self.gates,
            };
            let task = crate::runtime::spawn_detached(monitor(
                Arc::downgrade(&detector.inner),
                detector.inner.halt.clone(),
                Arc::clone(&detector.inner.delayer),
                self.on_timeout,
                targets,
            ));
            *detector.inner.monitor.lock() = Some(task);
        } else {
            tracing::trace!("infinite timeout detector, no monitor started");
        }

        if let Some(parent) = &self.parent {
            parent.add_cleanup(Arc::new(detector.clone()));
        }
        detector
    }
}

/// Everything a terminal detector signals.
struct Targets {
    watcher: Option<CancelWatcher>,
    pulses: Vec<AsyncPulse>,
    gates: Vec<AsyncGate>,
}

impl Targets {
    /// Events fire before the watcher, so anyone woken by the watcher sees
    /// them already set.
    fn trigger(&self, reason: &CancelReason) {
        for pulse in &self.pulses {
            pulse.set_now();
        }
        for gate in &self.gates {
            gate.set_now();
        }
        if let Some(watcher) = &self.watcher {
            watcher.cancel_with(reason);
        }
    }
}

struct DetectorInner {
    interval_ms: i64,
    deadline_ns: AtomicU64,
    timed_out: AtomicBool,
    halt: AsyncGate,
    delayer: Arc<dyn Delayer>,
    cleanup: CleanupState,
    monitor: Mutex<Option<TaskRef>>,
}

impl DetectorInner {
    /// Milliseconds until the deadline, rounded up; zero or less when due.
    fn remaining_ms(&self) -> i64 {
        let now = self.delayer.now().as_nanos();
        let deadline = self.deadline_ns.load(Ordering::Acquire);
        if deadline <= now {
            return 0;
        }
        i64::try_from((deadline - now).div_ceil(1_000_000)).unwrap_or(i64::MAX)
    }
}

impl Drop for DetectorInner {
    fn drop(&mut self) {
        self.halt.set_now();
    }
}

/// A renewable timeout.
///
/// Handles are cheap to clone; clones share one detector.
///
/// # Example
///
/// ```ignore
/// let watcher = CancelWatcher::new([]);
/// let detector = TimeoutDetectorBuilder::new(5_000)
///     .watcher(watcher.clone())
///     .start();
/// while let Some(chunk) = stream.next().await {
///     detector.keep();
///     process(chunk);
/// }
/// ```
#[derive(Clone)]
pub struct TimeoutDetector {
    inner: Arc<DetectorInner>,
}

impl fmt::Debug for TimeoutDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutDetector")
            .field("interval_ms", &self.inner.interval_ms)
            .field("timed_out", &self.is_timed_out())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl TimeoutDetector {
    /// Shorthand for a detector that only cancels `watcher`.
    #[must_use]
    pub fn new(interval_ms: i64, watcher: CancelWatcher) -> Self {
        TimeoutDetectorBuilder::new(interval_ms).watcher(watcher).start()
    }

    /// Moves the deadline to one interval from now.
    pub fn keep(&self) {
        if self.inner.interval_ms < 0 {
            return;
        }
        let now = self.inner.delayer.now();
        let deadline = now.saturating_add_millis(self.inner.interval_ms.unsigned_abs());
        self.inner
            .deadline_ns
            .store(deadline.as_nanos(), Ordering::Release);
    }

    /// Returns the current deadline on the detector's clock.
    #[must_use]
    pub fn deadline(&self) -> Option<Time> {
        (self.inner.interval_ms >= 0)
            .then(|| Time::from_nanos(self.inner.deadline_ns.load(Ordering::Acquire)))
    }

    /// Returns the interval in milliseconds.
    #[must_use]
    pub fn interval_ms(&self) -> i64 {
        self.inner.interval_ms
    }

    /// Returns true once a timeout was confirmed.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    /// Halts the monitor loop. Idempotent.
    pub fn dispose(&self) {
        if self.inner.cleanup.begin_dispose() {
            self.inner.halt.set_now();
        }
    }

    /// Returns true once disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.cleanup.is_disposed()
    }

    fn monitor_task(&self) -> Option<TaskRef> {
        self.inner.monitor.lock().clone()
    }
}

impl Dispose for TimeoutDetector {
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl AsyncCleanup for TimeoutDetector {
    fn cleanup(&self) -> CleanupFuture {
        let detector = self.clone();
        Box::pin(async move {
            let owned = detector.clone();
            detector
                .inner
                .cleanup
                .run_cleanup(move || async move {
                    owned.dispose();
                    if let Some(task) = owned.monitor_task() {
                        task.wait().await;
                    }
                    Ok(())
                })
                .await
        })
    }
}

async fn monitor(
    weak: Weak<DetectorInner>,
    halt: AsyncGate,
    delayer: Arc<dyn Delayer>,
    mut on_timeout: Option<TimeoutCallback>,
    targets: Targets,
) -> crate::Result<()> {
    loop {
        let remaining = {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if halt.is_set() {
                tracing::debug!("timeout detector halted");
                targets.trigger(&CancelReason::halted());
                return Ok(());
            }
            let mut remaining = inner.remaining_ms();
            if remaining <= 0 {
                let reprieve = on_timeout.as_mut().is_some_and(|callback| {
                    match catch_unwind(AssertUnwindSafe(callback)) {
                        Ok(keep) => keep,
                        Err(payload) => {
                            let err = Error::from_panic(payload.as_ref());
                            tracing::warn!(error = %err, "timeout callback panicked");
                            false
                        }
                    }
                });
                if !reprieve {
                    inner.timed_out.store(true, Ordering::Release);
                    tracing::debug!(interval_ms = inner.interval_ms, "timeout detector expired");
                    targets.trigger(&CancelReason::timeout());
                    return Ok(());
                }
                TimeoutDetector {
                    inner: Arc::clone(&inner),
                }
                .keep();
                tracing::trace!("timeout detector reprieve granted");
                remaining = inner.remaining_ms();
            }
            remaining
        };
        WaitObjects::new()
            .gate(&halt)
            .timeout(remaining.max(1))
            .policy(ExceptionPolicy::empty())
            .delayer(delayer.as_ref())
            .wait()
            .await?;
    }
}

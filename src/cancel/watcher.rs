//! Derived cancellation: fire when any watched upstream signal fires.
//!
//! A [`CancelWatcher`] owns a [`CancellationSource`] whose signal is
//! cancelled as soon as any signal in its watch set is. The watch set can
//! grow after construction. Derived signals are valid upstream inputs to
//! other watchers, so watchers compose into trees.
//!
//! # State Machine
//!
//! ```text
//! Active --(watched signal fired | cancel())--> Canceled
//! Active --(dispose: Halted)-------------------> Canceled
//! ```
//!
//! The transition happens exactly once, in this order: derived source
//! cancelled, canceled gate set, `is_canceled` flag raised, callbacks run.
//!
//! # Monitor Loop
//!
//! Each watcher runs one detached loop that waits on its current watch set
//! plus an internal pulse. [`CancelWatcher::add_watch`], [`cancel`] and
//! [`dispose`] poke the pulse so the loop re-reads the watch set. The loop
//! only holds a weak reference between waits, so dropping every handle to an
//! undisposed watcher still lets it exit.
//!
//! [`cancel`]: CancelWatcher::cancel
//! [`dispose`]: CancelWatcher::dispose

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::{CancellationSignal, CancellationSource};
use crate::cleanup::{AsyncCleanup, CleanupFuture, CleanupGraph, CleanupState, Dispose};
use crate::combinator::{ExceptionPolicy, WaitObjects};
use crate::error::Error;
use crate::runtime::TaskRef;
use crate::sync::{AsyncGate, AsyncPulse, GateWait};
use crate::types::{CancelKind, CancelReason};
use crate::util::OnceFlag;

type CanceledCallback = Box<dyn FnOnce(&CancelReason) + Send>;

struct WatcherInner {
    source: CancellationSource,
    canceled_gate: AsyncGate,
    canceled: AtomicBool,
    /// `None` once the callbacks have been run.
    callbacks: Mutex<Option<Vec<CanceledCallback>>>,
    watches: Mutex<Vec<CancellationSignal>>,
    wake: AsyncPulse,
    halted: AtomicBool,
    transition: OnceFlag,
    cleanup: CleanupState,
    monitor: Mutex<Option<TaskRef>>,
}

impl WatcherInner {
    /// Performs the one-time transition to Canceled.
    fn transition(&self, reason: &CancelReason) -> bool {
        if !self.transition.fire() {
            return false;
        }
        self.source.cancel_with(reason);
        self.canceled_gate.set_now();
        self.canceled.store(true, Ordering::Release);
        tracing::debug!(reason = %reason, "cancel watcher canceled");

        let callbacks = self.callbacks.lock().take().unwrap_or_default();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(reason))) {
                let err = Error::from_panic(payload.as_ref());
                tracing::warn!(error = %err, "cancel watcher callback panicked");
            }
        }
        self.wake.set_now();
        true
    }

    /// Reason derived from the first cancelled watched signal, if any.
    fn fired_upstream(&self) -> Option<CancelReason> {
        self.watches
            .lock()
            .iter()
            .find(|signal| signal.is_cancelled())
            .map(|signal| {
                let upstream = signal.reason().unwrap_or_default();
                CancelReason {
                    kind: CancelKind::Upstream,
                    message: upstream.message,
                }
            })
    }
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        // Wake the monitor so it observes the dead weak reference and exits.
        self.wake.set_now();
    }
}

/// Merges many cancellation signals into one derived signal.
///
/// Handles are cheap to clone; clones share one watcher.
///
/// # Example
///
/// ```ignore
/// let user = CancellationSource::new();
/// let shutdown = CancellationSource::new();
/// let watcher = CancelWatcher::new([user.signal(), shutdown.signal()]);
/// watcher.on_canceled(|reason| tracing::info!(%reason, "stopping"));
/// shutdown.cancel();
/// watcher.wait_canceled().await;
/// ```
#[derive(Clone)]
pub struct CancelWatcher {
    inner: Arc<WatcherInner>,
}

impl fmt::Debug for CancelWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelWatcher")
            .field("canceled", &self.is_canceled())
            .field("watches", &self.inner.watches.lock().len())
            .field("disposed", &self.inner.cleanup.is_disposed())
            .finish()
    }
}

impl CancelWatcher {
    /// Creates a watcher over `signals` and starts its monitor loop.
    pub fn new(signals: impl IntoIterator<Item = CancellationSignal>) -> Self {
        let watcher = Self {
            inner: Arc::new(WatcherInner {
                source: CancellationSource::new(),
                canceled_gate: AsyncGate::new(),
                canceled: AtomicBool::new(false),
                callbacks: Mutex::new(Some(Vec::new())),
                watches: Mutex::new(
                    signals
                        .into_iter()
                        .filter(CancellationSignal::can_be_cancelled)
                        .collect(),
                ),
                wake: AsyncPulse::new(),
                halted: AtomicBool::new(false),
                transition: OnceFlag::new(),
                cleanup: CleanupState::new("CancelWatcher"),
                monitor: Mutex::new(None),
            }),
        };
        let task = crate::runtime::spawn_detached(monitor(
            Arc::downgrade(&watcher.inner),
            watcher.inner.wake.clone(),
        ));
        *watcher.inner.monitor.lock() = Some(task);
        watcher
    }

    /// Creates a watcher owned by `parent`: tearing down the graph disposes
    /// the watcher.
    pub fn with_parent(
        signals: impl IntoIterator<Item = CancellationSignal>,
        parent: &CleanupGraph,
    ) -> Self {
        let watcher = Self::new(signals);
        parent.add_cleanup(Arc::new(watcher.clone()));
        watcher
    }

    /// Adds more upstream signals. Already-cancelled ones cancel the watcher
    /// on the monitor's next pass.
    pub fn add_watch(&self, signals: impl IntoIterator<Item = CancellationSignal>) {
        let added = {
            let mut watches = self.inner.watches.lock();
            let before = watches.len();
            watches.extend(signals.into_iter().filter(CancellationSignal::can_be_cancelled));
            watches.len() - before
        };
        if added > 0 {
            tracing::trace!(added, "cancel watcher watch set grew");
            self.inner.wake.set_now();
        }
    }

    /// Cancels the derived signal with a user reason.
    ///
    /// Returns true if this call performed the transition.
    pub fn cancel(&self) -> bool {
        self.cancel_with(&CancelReason::default())
    }

    /// Cancels the derived signal with `reason`.
    pub fn cancel_with(&self, reason: &CancelReason) -> bool {
        self.inner.transition(reason)
    }

    /// Returns the derived signal.
    #[must_use]
    pub fn signal(&self) -> CancellationSignal {
        self.inner.source.signal()
    }

    /// Returns true once canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Returns true if the watcher was canceled by disposal.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire)
    }

    /// Returns the number of watched upstream signals.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.inner.watches.lock().len()
    }

    /// Returns the gate set on cancellation.
    #[must_use]
    pub fn canceled_gate(&self) -> AsyncGate {
        self.inner.canceled_gate.clone()
    }

    /// Returns a future resolving once canceled.
    pub fn wait_canceled(&self) -> GateWait {
        self.inner.canceled_gate.wait()
    }

    /// Registers a callback run exactly once on cancellation.
    ///
    /// Runs before this returns if the watcher is already canceled.
    pub fn on_canceled<F>(&self, callback: F)
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        match callbacks.as_mut() {
            Some(list) => list.push(Box::new(callback)),
            None => {
                drop(callbacks);
                let reason = self.inner.source.signal().reason().unwrap_or_default();
                callback(&reason);
            }
        }
    }

    /// Halts the watcher: cancels it with a halted reason if it is still
    /// active, and stops the monitor loop. Idempotent.
    pub fn dispose(&self) {
        if !self.inner.cleanup.begin_dispose() {
            return;
        }
        if !self.is_canceled() {
            self.inner.halted.store(true, Ordering::Release);
        }
        self.inner.transition(&CancelReason::halted());
        self.inner.wake.set_now();
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

impl Dispose for CancelWatcher {
    fn dispose(&self) {
        Self::dispose(self);
    }
}

impl AsyncCleanup for CancelWatcher {
    fn cleanup(&self) -> CleanupFuture {
        let watcher = self.clone();
        Box::pin(async move {
            let owned = watcher.clone();
            watcher
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

/// The monitor loop. Holds only a weak reference while waiting.
async fn monitor(weak: Weak<WatcherInner>, wake: AsyncPulse) -> crate::Result<()> {
    loop {
        let watches = {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if inner.canceled.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(reason) = inner.fired_upstream() {
                inner.transition(&reason);
                return Ok(());
            }
            let watches = inner.watches.lock().clone();
            watches
        };
        WaitObjects::new()
            .cancels(&watches)
            .pulse(&wake)
            .policy(ExceptionPolicy::empty())
            .wait()
            .await?;
    }
}

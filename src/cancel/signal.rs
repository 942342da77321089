//! Cancellation sources and the signals they hand out.
//!
//! A [`CancellationSource`] owns the right to cancel; a
//! [`CancellationSignal`] observes it. Cancellation is one-way: once a source
//! is cancelled it stays cancelled, and every callback registered on its
//! signals runs exactly once.
//!
//! [`CancellationSignal::never`] is a distinguished signal with no source
//! behind it. It can never fire and registering on it does nothing.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use crate::error::Error;
use crate::runtime::TaskRef;
use crate::sync::{AsyncGate, GateWait};
use crate::types::CancelReason;

type CancelCallback = Box<dyn FnOnce(&CancelReason) + Send>;

#[derive(Default)]
struct CancelState {
    reason: Option<CancelReason>,
    callbacks: BTreeMap<u64, CancelCallback>,
    next_id: u64,
}

struct CancelInner {
    cancelled: AtomicBool,
    state: Mutex<CancelState>,
    gate: AsyncGate,
}

impl CancelInner {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            state: Mutex::new(CancelState::default()),
            gate: AsyncGate::new(),
        }
    }

    fn cancel(&self, reason: &CancelReason) -> bool {
        let callbacks = {
            // Holding the state lock across the flag flip means a concurrent
            // register either lands before (and is drained here) or observes
            // the flag and runs inline.
            let mut state = self.state.lock();
            if self
                .cancelled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.callbacks)
        };

        tracing::debug!(reason = %reason, callbacks = callbacks.len(), "cancellation requested");
        self.gate.set_now();
        for (_, callback) in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(reason))) {
                let err = Error::from_panic(payload.as_ref());
                tracing::warn!(error = %err, "cancellation callback panicked");
            }
        }
        true
    }
}

/// Owns the right to cancel.
///
/// Cloning a source yields another handle to the same cancellation state.
#[derive(Clone)]
pub struct CancellationSource {
    inner: Arc<CancelInner>,
}

impl fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    /// Creates a source that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner::new()),
        }
    }

    /// Returns a signal observing this source.
    #[must_use]
    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Cancels with a [`CancelKind::User`](crate::types::CancelKind::User) reason.
    ///
    /// Returns true if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.inner.cancel(&CancelReason::default())
    }

    /// Cancels with the given reason. Returns true if this call performed
    /// the cancellation; later reasons are ignored.
    pub fn cancel_with(&self, reason: &CancelReason) -> bool {
        self.inner.cancel(reason)
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels with a timeout reason after `ms` milliseconds on the
    /// process-wide delay scheduler.
    ///
    /// Only a weak reference is kept while waiting, so dropping every handle
    /// to the source abandons the timer.
    pub fn cancel_after(&self, ms: i64) -> TaskRef {
        let weak: Weak<CancelInner> = Arc::downgrade(&self.inner);
        let wait = crate::time::delay(ms);
        crate::runtime::spawn_detached(async move {
            wait.await;
            if let Some(inner) = weak.upgrade() {
                inner.cancel(&CancelReason::timeout());
            }
            Ok(())
        })
    }
}

/// Observes a [`CancellationSource`], or nothing at all for
/// [`never`](Self::never).
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Option<Arc<CancelInner>>,
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("CancellationSignal::never"),
            Some(_) => f
                .debug_struct("CancellationSignal")
                .field("cancelled", &self.is_cancelled())
                .finish(),
        }
    }
}

impl CancellationSignal {
    /// A signal that can never be cancelled.
    #[must_use]
    pub const fn never() -> Self {
        Self { inner: None }
    }

    /// Returns true once the source was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.cancelled.load(Ordering::Acquire))
    }

    /// Returns false for [`never`](Self::never).
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.as_ref()?.state.lock().reason.clone()
    }

    /// Returns `Err(Cancelled)` if the source was cancelled.
    pub fn check(&self) -> crate::Result<()> {
        match self.reason() {
            Some(reason) => Err(Error::cancelled(&reason)),
            None => Ok(()),
        }
    }

    /// Returns true if both signals observe the same source.
    #[must_use]
    pub fn same_source(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Returns a future that resolves once the source is cancelled.
    ///
    /// For [`never`](Self::never) the future stays pending forever.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            wait: self.inner.as_ref().map(|inner| inner.gate.wait()),
        }
    }

    /// Registers a callback invoked exactly once on cancellation.
    ///
    /// If the source is already cancelled the callback runs before this
    /// returns. Dropping the returned registration unregisters a callback
    /// that has not run yet.
    pub fn register<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        let Some(inner) = &self.inner else {
            return CancelRegistration::empty();
        };
        let mut state = inner.state.lock();
        if inner.cancelled.load(Ordering::Acquire) {
            let reason = state.reason.clone().unwrap_or_default();
            drop(state);
            callback(&reason);
            return CancelRegistration::empty();
        }
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));
        CancelRegistration {
            target: Some((Arc::downgrade(inner), id)),
        }
    }
}

impl From<&CancellationSource> for CancellationSignal {
    fn from(source: &CancellationSource) -> Self {
        source.signal()
    }
}

/// Future returned by [`CancellationSignal::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    wait: Option<GateWait>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &mut self.wait {
            Some(wait) => Pin::new(wait).poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Unregisters a cancellation callback when dropped.
#[derive(Debug)]
#[must_use = "dropping the registration unregisters the callback"]
pub struct CancelRegistration {
    target: Option<(Weak<CancelInner>, u64)>,
}

impl CancelRegistration {
    fn empty() -> Self {
        Self { target: None }
    }

    /// Keeps the callback registered for the lifetime of the source.
    pub fn forget(mut self) {
        self.target = None;
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some((weak, id)) = self.target.take() {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().callbacks.remove(&id);
            }
        }
    }
}

impl fmt::Debug for CancelInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelInner")
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, poll_once, wait_until};
    use crate::types::CancelKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn callbacks_run_exactly_once() {
        init_test("callbacks_run_exactly_once");
        let source = CancellationSource::new();
        let signal = source.signal();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        signal
            .register(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .forget();

        assert!(source.cancel());
        assert!(!source.cancel_with(&CancelReason::shutdown()));

        let count = hits.load(Ordering::SeqCst);
        crate::assert_with_log!(count == 1, "exactly once", 1usize, count);
        assert_eq!(signal.reason().map(|r| r.kind), Some(CancelKind::User));
        crate::test_complete!("callbacks_run_exactly_once");
    }

    #[test]
    fn dropped_registration_does_not_fire() {
        init_test("dropped_registration_does_not_fire");
        let source = CancellationSource::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let registration = source.signal().register(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(registration);
        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        crate::test_complete!("dropped_registration_does_not_fire");
    }

    #[test]
    fn late_registration_runs_inline() {
        init_test("late_registration_runs_inline");
        let source = CancellationSource::new();
        source.cancel_with(&CancelReason::timeout());
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let _reg = source.signal().register(move |reason| {
            *s.lock() = Some(reason.kind);
        });
        assert_eq!(*seen.lock(), Some(CancelKind::Timeout));
        crate::test_complete!("late_registration_runs_inline");
    }

    #[test]
    fn never_signal_is_inert() {
        init_test("never_signal_is_inert");
        let never = CancellationSignal::never();
        assert!(!never.can_be_cancelled());
        assert!(!never.is_cancelled());
        assert!(never.check().is_ok());
        assert!(poll_once(&mut never.cancelled()).is_pending());
        assert!(!never.same_source(&CancellationSignal::never()));
        let _reg = never.register(|_| panic!("never fires"));
        crate::test_complete!("never_signal_is_inert");
    }

    #[test]
    fn cancelled_future_resolves() {
        init_test("cancelled_future_resolves");
        let source = CancellationSource::new();
        let signal = source.signal();
        let mut fut = signal.cancelled();
        assert!(poll_once(&mut fut).is_pending());
        source.cancel();
        assert!(poll_once(&mut fut).is_ready());
        let err = signal.check().expect_err("cancelled");
        assert!(err.is_cancelled());
        crate::test_complete!("cancelled_future_resolves");
    }

    #[test]
    fn cancel_after_fires_with_timeout_reason() {
        init_test("cancel_after_fires_with_timeout_reason");
        let source = CancellationSource::new();
        let signal = source.signal();
        let _timer = source.cancel_after(20);
        let fired = wait_until(Duration::from_secs(5), || signal.is_cancelled());
        crate::assert_with_log!(fired, "cancelled by timer", true, fired);
        assert_eq!(signal.reason().map(|r| r.kind), Some(CancelKind::Timeout));
        crate::test_complete!("cancel_after_fires_with_timeout_reason");
    }
}

//! Edge-triggered event (auto reset).
//!
//! Each set of an [`AsyncPulse`] releases exactly one waiter. With nobody
//! waiting, the set is remembered as a single credit that the next waiter
//! consumes without suspending. Credits never accumulate past one.
//!
//! # Cancel Safety
//!
//! - `wait().await`: cancel-safe. A waiter that was handed the credit but is
//!   dropped before it observed the grant passes the credit on to the next
//!   waiter (or back to the event), so losing a race never consumes a signal.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use super::callbacks::{CallbackId, CallbackList};

#[derive(Debug, Default)]
struct PulseState {
    credit: bool,
    queue: VecDeque<(u64, Waker)>,
    /// Waiters handed a credit that have not yet observed it.
    granted: HashSet<u64>,
}

impl PulseState {
    /// Hands one credit to the oldest waiter, or stores it.
    fn deliver(&mut self) -> Option<Waker> {
        if let Some((id, waker)) = self.queue.pop_front() {
            self.granted.insert(id);
            Some(waker)
        } else {
            self.credit = true;
            None
        }
    }
}

#[derive(Debug, Default)]
struct PulseInner {
    state: Mutex<PulseState>,
    next_waiter: AtomicU64,
    callbacks: CallbackList,
}

impl PulseInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PulseState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// An auto-reset awaitable event.
///
/// Handles are cheap to clone; all clones observe the same event.
#[derive(Debug, Clone, Default)]
pub struct AsyncPulse {
    inner: Arc<PulseInner>,
}

impl AsyncPulse {
    /// Creates a pulse with no pending credit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a credit is waiting to be consumed.
    #[must_use]
    pub fn has_credit(&self) -> bool {
        self.inner.lock().credit
    }

    /// Returns the number of suspended waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Consumes the pending credit without waiting.
    ///
    /// Returns false if there was no credit.
    pub fn try_consume(&self) -> bool {
        std::mem::take(&mut self.inner.lock().credit)
    }

    /// Returns a future that resolves once this waiter is handed a credit.
    #[must_use]
    pub fn wait(&self) -> PulseWait {
        PulseWait {
            inner: Arc::clone(&self.inner),
            id: None,
        }
    }

    /// Signals the pulse.
    ///
    /// With `soft` the signal is deferred onto the background work queue.
    pub fn set(&self, soft: bool) {
        if soft {
            let pulse = self.clone();
            crate::runtime::defer(move || pulse.set_now());
        } else {
            self.set_now();
        }
    }

    /// Signals the pulse immediately: releases one waiter or stores a credit.
    pub fn set_now(&self) {
        let waker = self.inner.lock().deliver();
        if let Some(waker) = waker {
            waker.wake();
        }
        self.inner.callbacks.invoke();
    }

    /// Registers a callback run synchronously on every signal.
    pub fn on_set<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.register(callback)
    }

    /// Registers a callback deferred onto the background work queue on every
    /// signal.
    pub fn on_set_async<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.register_deferred(callback)
    }

    /// Removes a previously registered callback.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.remove(id)
    }
}

/// Future returned by [`AsyncPulse::wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct PulseWait {
    inner: Arc<PulseInner>,
    id: Option<u64>,
}

impl Future for PulseWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let inner = Arc::clone(&self.inner);
        let mut state = inner.lock();

        if let Some(id) = self.id {
            if state.granted.remove(&id) {
                self.id = None;
                return Poll::Ready(());
            }
            if let Some(entry) = state.queue.iter_mut().find(|(qid, _)| *qid == id) {
                if !entry.1.will_wake(cx.waker()) {
                    entry.1 = cx.waker().clone();
                }
            }
            return Poll::Pending;
        }

        if std::mem::take(&mut state.credit) {
            return Poll::Ready(());
        }

        let id = inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        state.queue.push_back((id, cx.waker().clone()));
        drop(state);
        self.id = Some(id);
        Poll::Pending
    }
}

impl Drop for PulseWait {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let waker = {
            let mut state = self.inner.lock();
            if state.granted.remove(&id) {
                // Undo: the credit was never observed, pass it on.
                state.deliver()
            } else {
                state.queue.retain(|(qid, _)| *qid != id);
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, poll_once};

    #[test]
    fn credit_is_consumed_by_next_waiter() {
        init_test("credit_is_consumed_by_next_waiter");
        let pulse = AsyncPulse::new();
        pulse.set_now();
        pulse.set_now();
        assert!(pulse.has_credit());

        let mut first = pulse.wait();
        let mut second = pulse.wait();
        assert!(poll_once(&mut first).is_ready());
        let blocked = poll_once(&mut second).is_pending();
        crate::assert_with_log!(blocked, "credits do not accumulate", true, blocked);
        crate::test_complete!("credit_is_consumed_by_next_waiter");
    }

    #[test]
    fn n_sets_release_exactly_n_of_m_waiters() {
        init_test("n_sets_release_exactly_n_of_m_waiters");
        let pulse = AsyncPulse::new();
        let mut waits: Vec<_> = (0..5).map(|_| pulse.wait()).collect();
        for fut in &mut waits {
            assert!(poll_once(fut).is_pending());
        }

        for _ in 0..3 {
            pulse.set_now();
        }
        let released = waits
            .iter_mut()
            .map(|fut| poll_once(fut).is_ready())
            .filter(|ready| *ready)
            .count();
        crate::assert_with_log!(released == 3, "exactly N released", 3usize, released);
        assert_eq!(pulse.waiter_count(), 2);
        assert!(!pulse.has_credit());

        pulse.set_now();
        let again = waits
            .iter_mut()
            .skip(3)
            .map(|fut| poll_once(fut).is_ready())
            .filter(|ready| *ready)
            .count();
        crate::assert_with_log!(again == 1, "one more released", 1usize, again);
        crate::test_complete!("n_sets_release_exactly_n_of_m_waiters");
    }

    #[test]
    fn dropped_granted_waiter_passes_credit_on() {
        init_test("dropped_granted_waiter_passes_credit_on");
        let pulse = AsyncPulse::new();
        let mut loser = pulse.wait();
        let mut next = pulse.wait();
        assert!(poll_once(&mut loser).is_pending());
        assert!(poll_once(&mut next).is_pending());

        pulse.set_now();
        drop(loser);

        let ready = poll_once(&mut next).is_ready();
        crate::assert_with_log!(ready, "credit handed to next waiter", true, ready);
        crate::test_complete!("dropped_granted_waiter_passes_credit_on");
    }

    #[test]
    fn dropped_granted_waiter_restores_credit() {
        init_test("dropped_granted_waiter_restores_credit");
        let pulse = AsyncPulse::new();
        let mut loser = pulse.wait();
        assert!(poll_once(&mut loser).is_pending());
        pulse.set_now();
        drop(loser);

        assert!(pulse.has_credit());
        assert!(pulse.try_consume());
        assert!(!pulse.try_consume());
        crate::test_complete!("dropped_granted_waiter_restores_credit");
    }
}

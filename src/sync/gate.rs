//! Level-triggered event (manual reset).
//!
//! An [`AsyncGate`] stays set once set: every waiter present at the moment of
//! the transition is released exactly once, and every wait that starts
//! afterwards resolves immediately until [`AsyncGate::reset`] is called.
//!
//! # Cancel Safety
//!
//! - `wait().await`: cancel-safe, the waiter slot is released on drop

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use super::callbacks::{CallbackId, CallbackList};

/// Slab of pending waiters that reuses freed slots.
#[derive(Debug, Default)]
struct WaiterSlab {
    entries: Vec<Option<Waker>>,
    free_slots: Vec<usize>,
}

impl WaiterSlab {
    fn insert(&mut self, waker: Waker) -> usize {
        if let Some(index) = self.free_slots.pop() {
            self.entries[index] = Some(waker);
            index
        } else {
            self.entries.push(Some(waker));
            self.entries.len() - 1
        }
    }

    fn remove(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            if entry.take().is_some() {
                self.free_slots.push(index);
            }
        }
    }

    fn drain(&mut self) -> Vec<Waker> {
        self.free_slots.clear();
        self.entries.drain(..).flatten().collect()
    }

    fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

#[derive(Debug, Default)]
struct GateState {
    set: bool,
    /// Incremented on every Unset -> Set transition.
    generation: u64,
    waiters: WaiterSlab,
}

#[derive(Debug, Default)]
struct GateInner {
    state: Mutex<GateState>,
    callbacks: CallbackList,
}

impl GateInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A manual-reset awaitable event.
///
/// Handles are cheap to clone; all clones observe the same event.
///
/// # Example
///
/// ```ignore
/// let gate = AsyncGate::new();
/// let waiter = gate.clone();
/// let handle = cordon::spawn(async move {
///     waiter.wait().await;
///     Ok(())
/// });
/// gate.set_now();
/// ```
#[derive(Debug, Clone, Default)]
pub struct AsyncGate {
    inner: Arc<GateInner>,
}

impl AsyncGate {
    /// Creates an unset gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gate that starts in the given state.
    #[must_use]
    pub fn with_state(set: bool) -> Self {
        let gate = Self::new();
        gate.inner.lock().set = set;
        gate
    }

    /// Returns true if the gate is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Returns the number of waiters currently suspended on this gate.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.active_count()
    }

    /// Returns the number of registered callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Returns a future that resolves once the gate is set.
    ///
    /// Resolves without suspending if the gate is already set.
    #[must_use]
    pub fn wait(&self) -> GateWait {
        GateWait {
            inner: Arc::clone(&self.inner),
            slot: None,
        }
    }

    /// Sets the gate.
    ///
    /// With `soft` the transition is deferred onto the background work queue
    /// so that cascading signals do not grow the caller's stack. A soft set on
    /// a gate that is already set does nothing.
    pub fn set(&self, soft: bool) {
        if !soft {
            self.set_now();
            return;
        }
        if self.is_set() {
            return;
        }
        let gate = self.clone();
        crate::runtime::defer(move || {
            gate.set_now();
        });
    }

    /// Sets the gate immediately, releasing all current waiters.
    ///
    /// Returns true if this call performed the Unset -> Set transition.
    /// Callbacks run on the calling thread after all waiters are woken.
    pub fn set_now(&self) -> bool {
        let wakers = {
            let mut state = self.inner.lock();
            if state.set {
                return false;
            }
            state.set = true;
            state.generation = state.generation.wrapping_add(1);
            state.waiters.drain()
        };
        tracing::trace!(released = wakers.len(), "gate set");
        for waker in wakers {
            waker.wake();
        }
        self.inner.callbacks.invoke();
        true
    }

    /// Returns the gate to the unset state.
    pub fn reset(&self) {
        self.inner.lock().set = false;
    }

    /// Registers a callback run synchronously on every Unset -> Set transition.
    pub fn on_set<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.register(callback)
    }

    /// Registers a callback deferred onto the background work queue on every
    /// Unset -> Set transition.
    pub fn on_set_async<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.register_deferred(callback)
    }

    /// Removes a callback registered with [`on_set`](Self::on_set) or
    /// [`on_set_async`](Self::on_set_async).
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.callbacks.remove(id)
    }

    /// Returns true if both handles refer to the same gate.
    #[must_use]
    pub fn same_gate(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Future returned by [`AsyncGate::wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct GateWait {
    inner: Arc<GateInner>,
    /// Slot index and the generation it was registered under.
    slot: Option<(usize, u64)>,
}

impl Future for GateWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let inner = Arc::clone(&self.inner);
        let mut state = inner.lock();

        if state.set {
            if let Some((index, generation)) = self.slot.take() {
                if generation == state.generation {
                    state.waiters.remove(index);
                }
            }
            return Poll::Ready(());
        }

        let slot = self.slot;
        match slot {
            // Released by a set that a later reset already undid.
            Some((_, generation)) if generation != state.generation => {
                self.slot = None;
                Poll::Ready(())
            }
            Some((index, _)) => {
                match state.waiters.entries.get_mut(index) {
                    Some(Some(waker)) if waker.will_wake(cx.waker()) => {}
                    Some(entry) => *entry = Some(cx.waker().clone()),
                    None => {}
                }
                Poll::Pending
            }
            None => {
                let index = state.waiters.insert(cx.waker().clone());
                let generation = state.generation;
                drop(state);
                self.slot = Some((index, generation));
                Poll::Pending
            }
        }
    }
}

impl Drop for GateWait {
    fn drop(&mut self) {
        if let Some((index, generation)) = self.slot.take() {
            let mut state = self.inner.lock();
            if state.generation == generation {
                state.waiters.remove(index);
            }
        }
    }
}

//! Callback lists fired on signal transitions.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Identifies a registered callback so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Clone)]
struct Entry {
    id: CallbackId,
    callback: Callback,
    deferred: bool,
}

/// An ordered list of callbacks invoked every time its owner signals.
///
/// Synchronous callbacks run on the signalling thread, in registration
/// order. Deferred callbacks are each pushed onto the background work queue
/// ([`runtime::defer`](crate::runtime::defer)) so a signal never grows the
/// signaller's stack through cascading handlers.
///
/// A panicking callback is logged and skipped; the remaining callbacks still
/// run.
#[derive(Default)]
pub struct CallbackList {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CallbackList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackList")
            .field("len", &self.len())
            .finish()
    }
}

impl CallbackList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback that runs synchronously on each invocation.
    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Arc::new(callback), false)
    }

    /// Registers a callback that runs on the background work queue.
    pub fn register_deferred<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Arc::new(callback), true)
    }

    fn push(&self, callback: Callback, deferred: bool) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Entry {
            id,
            callback,
            deferred,
        });
        id
    }

    /// Removes a callback. Returns false if it was not registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Returns the number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every callback once.
    ///
    /// The list is snapshotted first, so callbacks may register or remove
    /// entries without deadlocking.
    pub fn invoke(&self) {
        let snapshot: Vec<Entry> = self.entries.lock().clone();
        for entry in snapshot {
            if entry.deferred {
                let callback = Arc::clone(&entry.callback);
                crate::runtime::defer(move || run_guarded(&callback));
            } else {
                run_guarded(&entry.callback);
            }
        }
    }
}

fn run_guarded(callback: &Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback())) {
        let err = crate::error::Error::from_panic(payload.as_ref());
        tracing::warn!(error = %err, "signal callback panicked; continuing");
    }
}

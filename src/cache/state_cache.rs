//! The polling thread and its reader-facing handle.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use super::{StateCacheConfig, StateProvider};
use crate::error::{Error, ErrorKind, Result};

/// Identifies a change listener registered with [`StateCache::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

struct Slot<S> {
    value: Option<S>,
    last_error: Option<Error>,
    polls: u64,
    running: bool,
    notified: bool,
    stopping: bool,
    last_read: Instant,
}

struct CacheInner<P: StateProvider> {
    provider: P,
    config: StateCacheConfig,
    slot: Mutex<Slot<P::State>>,
    /// Wakes the polling thread early.
    wake: Condvar,
    /// Wakes readers waiting for the first poll.
    polled: Condvar,
    version: AtomicU64,
    listeners: Mutex<Vec<(SubscriptionId, Listener<P::State>)>>,
    next_listener: AtomicU64,
    starts: AtomicU64,
}

impl<P: StateProvider> CacheInner<P> {
    /// Stores a poll result. Returns true if the value changed.
    fn record(&self, fetched: Result<P::State>) -> bool {
        let mut slot = self.slot.lock();
        slot.polls += 1;
        let value = match fetched {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "state provider failed");
                slot.last_error = Some(err);
                self.polled.notify_all();
                return false;
            }
        };
        slot.last_error = None;
        let changed = slot.value.as_ref() != Some(&value);
        if changed {
            slot.value = Some(value.clone());
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        self.polled.notify_all();
        drop(slot);

        if changed {
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&value))).is_err() {
                    tracing::warn!("state cache listener panicked");
                }
            }
        }
        changed
    }

    fn fetch(&self) -> Result<P::State> {
        match catch_unwind(AssertUnwindSafe(|| self.provider.fetch())) {
            Ok(result) => result,
            Err(payload) => {
                let panic = Error::from_panic(payload.as_ref());
                Err(Error::new(ErrorKind::Provider)
                    .with_message(format!("provider panicked: {}", panic.message().unwrap_or(""))))
            }
        }
    }
}

fn run<P: StateProvider>(inner: &CacheInner<P>) {
    let config = &inner.config;
    let mut interval = config.initial_interval;
    loop {
        let changed = inner.record(inner.fetch());
        interval = config.next_interval(interval, changed);

        let mut slot = inner.slot.lock();
        let mut waited = false;
        loop {
            if slot.stopping || slot.last_read.elapsed() >= config.idle_timeout {
                slot.running = false;
                slot.stopping = false;
                inner.polled.notify_all();
                tracing::debug!(polls = slot.polls, "state cache thread stopped");
                return;
            }
            if slot.notified {
                slot.notified = false;
                interval = config.initial_interval;
                break;
            }
            if waited {
                break;
            }
            waited = inner.wake.wait_for(&mut slot, interval).timed_out();
        }
    }
}

/// A lazily polled, shared view of a provider's state.
///
/// The polling thread holds the cache alive while it runs.
pub struct StateCache<P: StateProvider> {
    inner: Arc<CacheInner<P>>,
}

impl<P: StateProvider> Clone for StateCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: StateProvider> fmt::Debug for StateCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCache")
            .field("version", &self.version())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<P: StateProvider> StateCache<P> {
    /// Creates a stopped cache over `provider`.
    pub fn new(provider: P, mut config: StateCacheConfig) -> Self {
        config.normalize();
        Self {
            inner: Arc::new(CacheInner {
                provider,
                config,
                slot: Mutex::new(Slot {
                    value: None,
                    last_error: None,
                    polls: 0,
                    running: false,
                    notified: false,
                    stopping: false,
                    last_read: Instant::now(),
                }),
                wake: Condvar::new(),
                polled: Condvar::new(),
                version: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                starts: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the cache settings.
    #[must_use]
    pub fn config(&self) -> &StateCacheConfig {
        &self.inner.config
    }

    /// Counts as a read and starts the polling thread if it is stopped.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock();
        slot.last_read = Instant::now();
        if slot.running {
            return Ok(());
        }
        slot.running = true;
        slot.stopping = false;
        drop(slot);

        let inner = Arc::clone(&self.inner);
        let name = format!("{}-state-cache", crate::config::global().thread_name_prefix);
        match thread::Builder::new().name(name).spawn(move || run(&inner)) {
            Ok(_) => {
                let starts = self.inner.starts.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(starts, "state cache thread started");
                Ok(())
            }
            Err(err) => {
                self.inner.slot.lock().running = false;
                Err(Error::internal("failed to spawn state cache thread").with_source(err))
            }
        }
    }

    /// Returns the cached state, blocking until the first poll if needed.
    ///
    /// Returns the provider's error when no value has been fetched yet. A
    /// failing poll after a success keeps serving the last good value.
    pub fn get(&self) -> Result<P::State> {
        self.start()?;
        let mut slot = self.inner.slot.lock();
        while slot.value.is_none() && slot.last_error.is_none() && slot.running {
            self.inner.polled.wait(&mut slot);
        }
        match (&slot.value, &slot.last_error) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(err)) => Err(err.clone()),
            (None, None) => Err(Error::internal("state cache stopped before its first poll")),
        }
    }

    /// Returns the cached state without blocking.
    #[must_use]
    pub fn try_get(&self) -> Option<P::State> {
        if let Err(err) = self.start() {
            tracing::warn!(error = %err, "state cache could not start");
        }
        self.inner.slot.lock().value.clone()
    }

    /// Returns how many times the value changed.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Returns the error from the latest poll, if it failed.
    #[must_use]
    pub fn last_error(&self) -> Option<Error> {
        self.inner.slot.lock().last_error.clone()
    }

    /// Registers `listener` to run on the polling thread after each change.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&P::State) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Polls again now and resets the interval.
    pub fn notify_changed(&self) {
        self.inner.slot.lock().notified = true;
        self.inner.wake.notify_all();
    }

    /// Asks the polling thread to stop. A later read restarts it.
    pub fn stop(&self) {
        let mut slot = self.inner.slot.lock();
        if slot.running {
            slot.stopping = true;
            self.inner.wake.notify_all();
        }
    }

    /// Returns true while the polling thread runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.slot.lock().running
    }

    /// Returns how many times the polling thread was started.
    #[must_use]
    pub fn start_count(&self) -> u64 {
        self.inner.starts.load(Ordering::Relaxed)
    }

    /// Returns true if both handles share one cache.
    #[must_use]
    pub fn same_cache(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

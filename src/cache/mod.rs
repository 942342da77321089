//! Background polling caches for externally owned state.
//!
//! A [`StateCache`] keeps the latest value of a [`StateProvider`] fresh on a
//! dedicated thread. The thread starts on the first read, polls on an
//! interval that widens while the value is stable, and stops on its own once
//! nobody has read the cache for [`StateCacheConfig::idle_timeout`].

mod registry;
mod state_cache;

use std::time::Duration;

use crate::error::Result;

pub use registry::StateCacheRegistry;
pub use state_cache::{StateCache, SubscriptionId};

/// Source of the state a [`StateCache`] polls.
pub trait StateProvider: Send + Sync + 'static {
    /// The polled value. Equality decides whether a poll counts as a change.
    type State: Clone + PartialEq + Send + Sync + 'static;

    /// Reads the current state. Runs on the cache thread.
    fn fetch(&self) -> Result<Self::State>;
}

/// Polling cadence and lifetime of a [`StateCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCacheConfig {
    /// Interval after a change or a change notification.
    pub initial_interval: Duration,
    /// Added to the interval after every unchanged poll.
    pub step: Duration,
    /// Upper bound for the interval.
    pub max_interval: Duration,
    /// The thread stops after this long without a read.
    pub idle_timeout: Duration,
}

impl Default for StateCacheConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            step: Duration::from_millis(50),
            max_interval: Duration::from_millis(1000),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

impl StateCacheConfig {
    /// Sets the interval bounds and growth step.
    #[must_use]
    pub fn with_intervals(mut self, initial: Duration, step: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.step = step;
        self.max_interval = max;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Clamps inconsistent values.
    pub fn normalize(&mut self) {
        if self.initial_interval.is_zero() {
            self.initial_interval = Duration::from_millis(1);
        }
        if self.max_interval < self.initial_interval {
            self.max_interval = self.initial_interval;
        }
    }

    /// Returns the interval to sleep after a poll.
    #[must_use]
    pub fn next_interval(&self, current: Duration, changed: bool) -> Duration {
        if changed {
            self.initial_interval
        } else {
            (current + self.step).min(self.max_interval)
        }
    }
}

//! Counters exposed by the delay scheduler.
//!
//! The scheduler reports its own state through [`SchedulerMetrics`] instead
//! of anyone peeking at timer or pool internals.

use serde::Serialize;

/// Point-in-time snapshot of a [`DelayScheduler`](crate::time::DelayScheduler).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    /// Distinct millisecond deadlines waiting to fire.
    pub pending_deadlines: usize,
    /// Futures currently suspended on those deadlines.
    pub pending_waiters: usize,
    /// Earliest pending deadline, in scheduler milliseconds.
    pub next_deadline_ms: Option<u64>,
    /// Scheduler clock reading when the snapshot was taken.
    pub now_ms: u64,
    /// Positive, finite delay requests served.
    pub requests: u64,
    /// Requests that attached to an existing deadline.
    pub coalesced: u64,
    /// Deadlines fired.
    pub fired: u64,
    /// Whether the timer thread is running.
    pub timer_running: bool,
    /// Live gate-firing worker threads.
    pub workers_active: usize,
    /// Worker threads currently firing a gate.
    pub workers_busy: usize,
    /// Worker threads spawned over the scheduler's lifetime.
    pub workers_spawned: u64,
}

impl SchedulerMetrics {
    /// Returns the share of requests that were coalesced, in `0.0..=1.0`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn coalesce_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.coalesced as f64 / self.requests as f64
        }
    }
}

//! Cordon: an async coordination core for cancellation, timed waits and teardown.
//!
//! # Overview
//!
//! Cordon provides the coordination plane that sits underneath connection
//! pools, copy-with-progress routines and storage providers: the pieces that
//! decide *when* work wakes up, *why* it stopped, and *who* tears it down.
//!
//! # Core Guarantees
//!
//! - **No lost wakeups**: a gate that is set stays set until reset; a pulse never holds more than one credit
//! - **Exactly-once transitions**: cancel watchers, timeout detectors and cleanup graphs fire once, however many times they are poked
//! - **Reverse-order teardown**: cleanup graphs dispose what they own last-registered-first, swallowing failures so siblings still run
//! - **Mergeable shared state**: independently created queues and hierarchies can be united at runtime without lost updates
//! - **Diagnosable shutdown**: every scoped resource registers with a leak tracker whose count is zero on a clean exit
//!
//! # Module Structure
//!
//! - [`types`]: Core value types (time, cancel reasons)
//! - [`util`]: Once-flag and slot arena
//! - [`error`]: Error types and the background error queue
//! - [`sync`]: Async gate (manual reset) and pulse (auto reset) events
//! - [`runtime`]: Elastic worker pool, task spawning, `block_on`
//! - [`time`]: Time sources and the precise delay scheduler
//! - [`cancel`]: Cancellation signals, cancel watchers, timeout detectors
//! - [`combinator`]: The `wait_objects` wait-for-any combinator
//! - [`cleanup`]: Reverse-order, at-most-once async cleanup graphs
//! - [`shared`]: Mergeable shared queues and hierarchies
//! - [`observability`]: Leak tracking and scheduler metrics
//! - [`cache`]: Background polling state caches
//! - [`config`]: Configuration and environment overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

pub mod cache;
pub mod cancel;
pub mod cleanup;
pub mod combinator;
pub mod config;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod shared;
pub mod sync;
pub mod time;
pub mod types;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

pub use cache::{StateCache, StateCacheConfig, StateCacheRegistry, StateProvider};
pub use cancel::{
    CancelRegistration, CancelWatcher, CancellationSignal, CancellationSource, Cancelled,
    TimeoutDetector, TimeoutDetectorBuilder,
};
pub use cleanup::{AsyncCleanup, CleanupGraph, CleanupKey, CleanupState, Dispose};
pub use combinator::{wait_objects, ExceptionPolicy, WaitObjects, WakeReason};
pub use config::{ConfigError, CordonConfig};
pub use error::{Error, ErrorCategory, ErrorKind, ErrorQueue, ErrorQueueConfig, Result, ResultExt};
pub use observability::{LeakGuard, LeakRecord, LeakReport, LeakTracker, SchedulerMetrics};
pub use runtime::{block_on, spawn, TaskCompletion, TaskHandle, TaskStatus, WorkerPool};
pub use shared::{MemberId, MergeDomain, Placement, QueuePolicy, SharedHierarchy, SharedQueue};
pub use sync::{AsyncGate, AsyncPulse, CallbackList};
pub use time::{delay, DelayScheduler, Delayer, TimeSource, VirtualClock, WallClock, INFINITE};
pub use types::{CancelKind, CancelReason, Time};

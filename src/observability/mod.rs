//! Diagnostics.
//!
//! - [`LeakTracker`]: registry of scoped resources that have been opened but
//!   not yet torn down, with text and JSON reports
//! - [`SchedulerMetrics`]: counters reported by the delay scheduler
//!
//! # Design Principles
//!
//! 1. **No stdout/stderr in core**: reports are returned as values, written
//!    to a caller-supplied sink, or logged through `tracing`
//! 2. **Explicit state**: the process-wide tracker is a handle
//!    ([`LeakTracker::global`]); tests create isolated instances

pub mod leak;
pub mod metrics;

pub use leak::{LeakGuard, LeakRecord, LeakReport, LeakTracker};
pub use metrics::SchedulerMetrics;

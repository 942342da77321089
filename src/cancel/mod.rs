//! Cancellation.
//!
//! - [`CancellationSource`] / [`CancellationSignal`]: one-way cancellation
//!   with exactly-once callbacks
//! - [`CancelWatcher`]: a derived signal that fires when any watched signal
//!   fires
//! - [`TimeoutDetector`]: a renewable dead-man's switch that cancels a
//!   watcher when it is not kept alive
//!
//! Cancellation is observed, never undone. There is no way to un-cancel a
//! source or a watcher.

mod signal;
mod timeout_detector;
mod watcher;

pub use signal::{CancelRegistration, CancellationSignal, CancellationSource, Cancelled};
pub use timeout_detector::{TimeoutDetector, TimeoutDetectorBuilder};
pub use watcher::CancelWatcher;

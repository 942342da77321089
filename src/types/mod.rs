//! Core value types shared by every cordon primitive.
//!
//! - [`time`]: Monotonic [`Time`] instants with millisecond views
//! - [`cancel`]: Cancellation reason and kind types

pub mod cancel;
pub mod time;

pub use cancel::{CancelKind, CancelReason};
pub use time::Time;

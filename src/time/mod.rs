//! Time sources and the precise delay scheduler.
//!
//! - [`TimeSource`]: [`WallClock`] for production, [`VirtualClock`] for tests
//! - [`DelayScheduler`]: one sorted deadline map plus one timer thread serving
//!   every [`delay`] in the process
//!
//! # Granularity
//!
//! Delays are whole milliseconds. A delay never resolves early. It resolves
//! late by at most the scheduler's polling ceiling (100 ms by default) when
//! the timer thread slept through an insertion, and by scheduling jitter
//! otherwise.
//!
//! # Example
//!
//! ```ignore
//! use cordon::time::{delay, INFINITE};
//!
//! delay(250).await;
//! delay(0).await; // immediate
//! // delay(INFINITE).await never returns
//! ```

mod clock;
mod delay;

pub use clock::{TimeSource, VirtualClock, WallClock};
pub use delay::{delay, Delay, DelayScheduler, Delayer, INFINITE};

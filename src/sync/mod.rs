//! Awaitable signal primitives.
//!
//! # Primitives
//!
//! - [`AsyncGate`]: Level-triggered event (manual reset). Once set, every
//!   current and future waiter passes until [`AsyncGate::reset`].
//! - [`AsyncPulse`]: Edge-triggered event (auto reset). Each set releases
//!   exactly one waiter, or leaves a single credit for the next one.
//! - [`CallbackList`]: Callbacks fired on every signal, synchronously or
//!   deferred onto the background work queue.
//!
//! # Cancel Safety
//!
//! Dropping a pending wait future unregisters it. A pulse wait that was
//! granted a credit but dropped before observing it hands the credit back,
//! so losing a race in [`wait_objects`](crate::combinator::wait_objects)
//! never swallows a signal.
//!
//! # Hazards
//!
//! Dropping the last handle to an event that still has waiters leaves those
//! waiters pending forever. Nothing detects this.

mod callbacks;
mod gate;
mod pulse;

pub use callbacks::{CallbackId, CallbackList};
pub use gate::{AsyncGate, GateWait};
pub use pulse::{AsyncPulse, PulseWait};

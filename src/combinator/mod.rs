//! Combinators over the coordination primitives.
//!
//! - [`wait`]: Wait for the first of a mixed set of tasks, cancellation
//!   signals, pulses, gates and a timeout, and classify why the wait ended

pub mod wait;

pub use wait::{wait_objects, ExceptionPolicy, WaitObjects, WakeReason};

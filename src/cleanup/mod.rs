//! Deterministic teardown for asynchronously disposed objects.
//!
//! A [`CleanupGraph`] collects three kinds of entries:
//!
//! - plain [`Dispose`] objects, torn down synchronously
//! - [`AsyncCleanup`] handles, whose async teardown is awaited
//! - bare tasks, awaited best-effort
//!
//! Teardown walks each kind in reverse registration order, and the kinds in
//! the fixed order above. Every entry is torn down at most once no matter how
//! many times, or from how many threads, the graph is torn down.
//!
//! Objects that own their teardown embed a [`CleanupState`], which supplies
//! the idempotence guards and the leak-tracker scope.

mod graph;
mod state;

pub use graph::{CleanupGraph, CleanupKey};
pub use state::CleanupState;

use std::future::Future;
use std::pin::Pin;

use crate::error::Result;

/// Future returned by [`AsyncCleanup::cleanup`].
pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Synchronous, idempotent teardown.
pub trait Dispose: Send + Sync {
    /// Releases the object's resources. Calls after the first do nothing.
    fn dispose(&self);
}

/// Asynchronous, idempotent teardown.
///
/// `cleanup` implies `dispose`. Awaiting it a second time, or concurrently,
/// waits for the first teardown instead of running another.
pub trait AsyncCleanup: Dispose {
    /// Tears the object down and resolves once it is fully stopped.
    fn cleanup(&self) -> CleanupFuture;
}

impl<F> Dispose for F
where
    F: Fn() + Send + Sync,
{
    fn dispose(&self) {
        self();
    }
}

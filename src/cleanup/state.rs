//! Idempotence guards shared by every cleanupable object.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::observability::{LeakGuard, LeakTracker};
use crate::sync::AsyncGate;
use crate::util::OnceFlag;

/// Dispose flag and leak scope; outlives the owner while a teardown runs.
#[derive(Debug)]
struct Scope {
    label: String,
    disposed: OnceFlag,
    guard: Mutex<Option<LeakGuard>>,
}

impl Scope {
    fn close(&self) -> bool {
        if !self.disposed.fire() {
            return false;
        }
        self.guard.lock().take();
        tracing::trace!(label = %self.label, "disposed");
        true
    }
}

/// Marks a teardown finished when dropped, including after a panic.
struct Finish {
    scope: Arc<Scope>,
    cleaned: AsyncGate,
}

impl Drop for Finish {
    fn drop(&mut self) {
        self.scope.close();
        self.cleaned.set_now();
    }
}

/// Dispose and cleanup guards plus the object's leak-tracker scope.
///
/// The scope opens at construction and closes when the object is disposed,
/// so a live, undisposed object shows up in the leak report.
#[derive(Debug)]
pub struct CleanupState {
    scope: Arc<Scope>,
    cleanup_started: OnceFlag,
    cleaned: AsyncGate,
}

impl CleanupState {
    /// Opens a scope labelled `label` in the process-wide leak tracker.
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_tracker(LeakTracker::global(), label)
    }

    /// Opens a scope in `tracker`.
    pub fn with_tracker(tracker: &LeakTracker, label: impl Into<String>) -> Self {
        let label = label.into();
        let guard = tracker.enter(label.clone());
        Self {
            scope: Arc::new(Scope {
                label,
                disposed: OnceFlag::new(),
                guard: Mutex::new(Some(guard)),
            }),
            cleanup_started: OnceFlag::new(),
            cleaned: AsyncGate::new(),
        }
    }

    /// Returns the leak-tracker label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.scope.label
    }

    /// Marks the object disposed and closes its scope.
    ///
    /// Returns true only for the first call; that caller runs the teardown.
    pub fn begin_dispose(&self) -> bool {
        self.scope.close()
    }

    /// Returns true once disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.scope.disposed.is_fired()
    }

    /// Returns `Err(Disposed)` once disposed.
    pub fn check_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::disposed(&self.scope.label))
        } else {
            Ok(())
        }
    }

    /// Returns true once an async cleanup has finished.
    #[must_use]
    pub fn is_cleaned(&self) -> bool {
        self.cleaned.is_set()
    }

    /// Runs `teardown` for the first caller; every other caller waits for
    /// that run to finish.
    ///
    /// The teardown runs as its own task, so dropping the caller's future
    /// does not abandon it: it still finishes and releases later callers.
    pub async fn run_cleanup<F, Fut>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if !self.cleanup_started.fire() {
            self.cleaned.wait().await;
            return Ok(());
        }
        let finish = Finish {
            scope: Arc::clone(&self.scope),
            cleaned: self.cleaned.clone(),
        };
        let teardown = teardown();
        crate::runtime::spawn(async move {
            let _finish = finish;
            teardown.await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::block_on;
    use crate::test_utils::init_test;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispose_closes_scope_once() {
        init_test("dispose_closes_scope_once");
        let tracker = LeakTracker::new();
        let state = CleanupState::with_tracker(&tracker, "resource");
        assert_eq!(tracker.count(), 1);
        assert!(state.check_live().is_ok());

        assert!(state.begin_dispose());
        assert!(!state.begin_dispose());
        assert_eq!(tracker.count(), 0);
        let err = state.check_live().expect_err("disposed");
        assert_eq!(err.kind(), crate::ErrorKind::Disposed);
        crate::test_complete!("dispose_closes_scope_once");
    }

    #[test]
    fn cleanup_runs_once() {
        init_test("cleanup_runs_once");
        let tracker = LeakTracker::new();
        let state = CleanupState::with_tracker(&tracker, "resource");
        let runs = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let runs = Arc::clone(&runs);
            block_on(state.run_cleanup(|| async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .expect("cleanup");
        }
        let count = runs.load(Ordering::SeqCst);
        crate::assert_with_log!(count == 1, "teardown ran once", 1usize, count);
        assert!(state.is_cleaned());
        assert!(state.is_disposed());
        assert!(tracker.report().is_clean());
        crate::test_complete!("cleanup_runs_once");
    }
}

//! Leak tracking for scoped resources.
//!
//! Every long-lived or asynchronously disposed object opens a [`LeakGuard`]
//! when it is created and drops it when it is torn down. Whatever is still
//! registered at shutdown is a leak; a count of zero is the clean-exit
//! signal test harnesses assert on.
//!
//! # Example
//!
//! ```ignore
//! use cordon::observability::LeakTracker;
//!
//! let tracker = LeakTracker::new();
//! let guard = tracker.enter("connection pool");
//! assert_eq!(tracker.count(), 1);
//! drop(guard);
//! assert_eq!(tracker.count(), 0);
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct OpenScope {
    label: String,
    opened_at: Instant,
}

#[derive(Debug, Default)]
struct TrackerInner {
    next_id: AtomicU64,
    open: Mutex<BTreeMap<u64, OpenScope>>,
}

/// Registry of scopes that have been entered but not yet exited.
///
/// Handles are cheap to clone; clones share one registry.
#[derive(Debug, Clone, Default)]
pub struct LeakTracker {
    inner: Arc<TrackerInner>,
}

/// A still-open scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakRecord {
    /// Registration id, increasing in entry order.
    pub id: u64,
    /// Caller-supplied label.
    pub label: String,
    /// How long the scope has been open, in milliseconds.
    pub age_ms: u64,
}

/// Snapshot of every open scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    /// Number of open scopes.
    pub count: usize,
    /// The open scopes, oldest first.
    pub records: Vec<LeakRecord>,
}

impl LeakReport {
    /// Returns true if nothing is open.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.count == 0
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.records.is_empty() {
            return writeln!(f, "no open scopes");
        }
        writeln!(f, "{} open scope(s):", self.count)?;
        for record in &self.records {
            writeln!(f, "  #{} {} (open {} ms)", record.id, record.label, record.age_ms)?;
        }
        Ok(())
    }
}

impl LeakTracker {
    /// Creates an isolated tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide tracker.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<LeakTracker> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Registers an open scope. The scope closes when the guard drops.
    pub fn enter(&self, label: impl Into<String>) -> LeakGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        tracing::trace!(id, label = %label, "scope entered");
        self.inner.open.lock().insert(
            id,
            OpenScope {
                label,
                opened_at: Instant::now(),
            },
        );
        LeakGuard {
            tracker: Arc::clone(&self.inner),
            id,
        }
    }

    /// Returns the number of open scopes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.open.lock().len()
    }

    /// Returns every open scope, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LeakRecord> {
        let now = Instant::now();
        self.inner
            .open
            .lock()
            .iter()
            .map(|(&id, scope)| LeakRecord {
                id,
                label: scope.label.clone(),
                age_ms: now.saturating_duration_since(scope.opened_at).as_millis() as u64,
            })
            .collect()
    }

    /// Returns open scopes older than `threshold`.
    #[must_use]
    pub fn older_than(&self, threshold: Duration) -> Vec<LeakRecord> {
        let threshold_ms = threshold.as_millis() as u64;
        self.records()
            .into_iter()
            .filter(|record| record.age_ms >= threshold_ms)
            .collect()
    }

    /// Returns a snapshot report.
    #[must_use]
    pub fn report(&self) -> LeakReport {
        let records = self.records();
        LeakReport {
            count: records.len(),
            records,
        }
    }

    /// Returns the report rendered as human-readable text.
    #[must_use]
    pub fn report_string(&self) -> String {
        self.report().to_string()
    }

    /// Returns the report as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.report())
    }

    /// Writes the report to `out`.
    pub fn write_report<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        write!(out, "{}", self.report())
    }

    /// Logs the report: one `warn` per open scope, or one `info` when clean.
    pub fn print(&self) {
        let report = self.report();
        if report.is_clean() {
            tracing::info!("leak tracker: no open scopes");
            return;
        }
        for record in &report.records {
            tracing::warn!(
                id = record.id,
                label = %record.label,
                age_ms = record.age_ms,
                "scope still open"
            );
        }
    }
}

/// Closes its scope in the owning [`LeakTracker`] when dropped.
#[derive(Debug)]
#[must_use = "the scope closes as soon as the guard is dropped"]
pub struct LeakGuard {
    tracker: Arc<TrackerInner>,
    id: u64,
}

impl LeakGuard {
    /// Returns the registration id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        self.tracker.open.lock().remove(&self.id);
        tracing::trace!(id = self.id, "scope exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test;

    #[test]
    fn guard_drop_closes_scope() {
        init_test("guard_drop_closes_scope");
        let tracker = LeakTracker::new();
        let a = tracker.enter("watcher");
        let b = tracker.enter("detector");
        assert_eq!(tracker.count(), 2);

        drop(a);
        let labels: Vec<_> = tracker.records().into_iter().map(|r| r.label).collect();
        crate::assert_with_log!(labels == vec!["detector"], "one left", vec!["detector"], labels);

        drop(b);
        assert!(tracker.report().is_clean());
        crate::test_complete!("guard_drop_closes_scope");
    }

    #[test]
    fn report_renders_text_and_json() {
        init_test("report_renders_text_and_json");
        let tracker = LeakTracker::new();
        assert_eq!(tracker.report_string(), "no open scopes\n");

        let guard = tracker.enter("pool");
        let text = tracker.report_string();
        assert!(text.starts_with("1 open scope(s):"));
        assert!(text.contains(&format!("#{} pool", guard.id())));

        let json = tracker.to_json().expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["count"], 1);
        assert_eq!(value["records"][0]["label"], "pool");

        let mut out = Vec::new();
        tracker.write_report(&mut out).expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), text);
        tracker.print();
        crate::test_complete!("report_renders_text_and_json");
    }

    #[test]
    fn older_than_filters_young_scopes() {
        init_test("older_than_filters_young_scopes");
        let tracker = LeakTracker::new();
        let _old = tracker.enter("old");
        std::thread::sleep(Duration::from_millis(30));
        let _young = tracker.enter("young");
        let stale = tracker.older_than(Duration::from_millis(25));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].label, "old");
        crate::test_complete!("older_than_filters_young_scopes");
    }

    #[test]
    fn clones_share_registry() {
        init_test("clones_share_registry");
        let tracker = LeakTracker::new();
        let clone = tracker.clone();
        let _guard = clone.enter("shared");
        assert_eq!(tracker.count(), 1);
        assert_eq!(LeakTracker::new().count(), 0);
        crate::test_complete!("clones_share_registry");
    }
}

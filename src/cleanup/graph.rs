//! The cleanup graph.
//!
//! Entries live in an [`Arena`]; registration hands back a [`CleanupKey`]
//! instead of giving the entry a pointer to the graph. Per-kind order vectors
//! record registration order so teardown can walk it in reverse.
//!
//! # Lock Ordering
//!
//! [`CleanupGraph::merge_from`] holds both graphs' locks. They are always
//! acquired in increasing graph id order.

use futures_lite::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{AsyncCleanup, CleanupFuture, CleanupState, Dispose};
use crate::error::{Error, ErrorQueue, Result};
use crate::runtime::{TaskCompletion, TaskRef};
use crate::util::{Arena, ArenaIndex};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an entry registered with a [`CleanupGraph`].
///
/// Keys are only meaningful to the graph that issued them. After
/// [`CleanupGraph::merge_from`] the moved entries are owned by the target
/// graph and their old keys no longer match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupKey {
    graph: u64,
    kind: EntryKind,
    index: ArenaIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntryKind {
    Disposable,
    Handle,
    Task,
}

impl EntryKind {
    const fn slot(self) -> usize {
        match self {
            Self::Disposable => 0,
            Self::Handle => 1,
            Self::Task => 2,
        }
    }
}

enum Entry {
    Disposable(Arc<dyn Dispose>),
    Handle(Arc<dyn AsyncCleanup>),
    Task(TaskRef),
}

impl Entry {
    const fn kind(&self) -> EntryKind {
        match self {
            Self::Disposable(_) => EntryKind::Disposable,
            Self::Handle(_) => EntryKind::Handle,
            Self::Task(_) => EntryKind::Task,
        }
    }
}

#[derive(Default)]
struct GraphState {
    entries: Arena<Entry>,
    /// Registration order per kind.
    order: [Vec<ArenaIndex>; 3],
    disposed: bool,
}

impl GraphState {
    fn insert(&mut self, entry: Entry) -> (EntryKind, ArenaIndex) {
        let kind = entry.kind();
        let index = self.entries.insert(entry);
        self.order[kind.slot()].push(index);
        (kind, index)
    }

    /// Removes every entry of `kind`, newest first.
    fn drain_reversed(&mut self, kind: EntryKind) -> Vec<Entry> {
        let order = std::mem::take(&mut self.order[kind.slot()]);
        order
            .into_iter()
            .rev()
            .filter_map(|index| self.entries.remove(index))
            .collect()
    }

    /// Removes every entry, oldest first, grouped by kind.
    fn drain_in_order(&mut self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.entries.len());
        for slot in 0..self.order.len() {
            let order = std::mem::take(&mut self.order[slot]);
            out.extend(order.into_iter().filter_map(|index| self.entries.remove(index)));
        }
        out
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct GraphInner {
    id: u64,
    state: Mutex<GraphState>,
    cleanup: CleanupState,
    sink: Mutex<Option<ErrorQueue>>,
}

impl GraphInner {
    /// Forwards a swallowed failure to the log and the optional sink.
    fn report(&self, err: Error) {
        tracing::warn!(graph = self.id, error = %err, "cleanup step failed");
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            if let Err(raised) = sink.add(err, false, true) {
                tracing::warn!(error = %raised, "error sink rejected cleanup failure");
            }
        }
    }

    fn dispose_entry(&self, disposable: &dyn Dispose) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| disposable.dispose())) {
            self.report(Error::from_panic(payload.as_ref()));
        }
    }

    async fn cleanup_handle(&self, handle: &dyn AsyncCleanup) {
        match AssertUnwindSafe(handle.cleanup()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.report(err),
            Err(payload) => self.report(Error::from_panic(payload.as_ref())),
        }
    }

    async fn await_task(&self, task: &TaskRef) {
        task.wait().await;
        if let Some(fault) = task.fault() {
            if !fault.is_cancelled() {
                self.report(fault);
            }
        }
    }

    /// Tears down an entry that arrived after the graph was disposed.
    fn tear_down_late(self: &Arc<Self>, entry: Entry) {
        tracing::debug!(graph = self.id, kind = ?entry.kind(), "late add torn down immediately");
        match entry {
            Entry::Disposable(disposable) => self.dispose_entry(disposable.as_ref()),
            Entry::Handle(handle) => {
                let inner = Arc::clone(self);
                crate::runtime::spawn_detached(async move {
                    inner.cleanup_handle(handle.as_ref()).await;
                    Ok(())
                });
            }
            Entry::Task(_) => {}
        }
    }
}

/// Collects disposables, cleanup handles and tasks, and tears them down in
/// reverse registration order exactly once.
///
/// Handles are cheap to clone; clones share one graph.
///
/// # Example
///
/// ```ignore
/// let graph = CleanupGraph::new();
/// graph.add_disposable(Arc::new(|| println!("closed")));
/// graph.add_task(cordon::spawn(async { Ok(()) }).task_ref());
/// graph.cleanup_async().await;
/// ```
#[derive(Clone)]
pub struct CleanupGraph {
    inner: Arc<GraphInner>,
}

impl fmt::Debug for CleanupGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CleanupGraph")
            .field("id", &self.inner.id)
            .field("entries", &state.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl Default for CleanupGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        let id = NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(GraphInner {
                id,
                state: Mutex::new(GraphState::default()),
                cleanup: CleanupState::new(format!("CleanupGraph#{id}")),
                sink: Mutex::new(None),
            }),
        }
    }

    /// Creates a graph owned by `parent`: tearing down the parent tears down
    /// this graph as one of its cleanup handles.
    #[must_use]
    pub fn child_of(parent: &Self) -> Self {
        let child = Self::new();
        parent.add_cleanup(Arc::new(child.clone()));
        child
    }

    /// Forwards swallowed teardown failures to `sink` in addition to the log.
    #[must_use]
    pub fn with_error_sink(self, sink: ErrorQueue) -> Self {
        *self.inner.sink.lock() = Some(sink);
        self
    }

    fn add(&self, entry: Entry) -> Option<CleanupKey> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            drop(state);
            self.inner.tear_down_late(entry);
            return None;
        }
        let (kind, index) = state.insert(entry);
        tracing::trace!(graph = self.inner.id, kind = ?kind, "cleanup entry added");
        Some(CleanupKey {
            graph: self.inner.id,
            kind,
            index,
        })
    }

    /// Registers a plain disposable.
    ///
    /// Returns `None` if the graph was already disposed, in which case the
    /// disposable has been disposed before this returns.
    pub fn add_disposable(&self, disposable: Arc<dyn Dispose>) -> Option<CleanupKey> {
        self.add(Entry::Disposable(disposable))
    }

    /// Registers an async cleanup handle.
    ///
    /// Returns `None` if the graph was already disposed, in which case the
    /// handle's cleanup has been started in the background.
    pub fn add_cleanup(&self, handle: Arc<dyn AsyncCleanup>) -> Option<CleanupKey> {
        self.add(Entry::Handle(handle))
    }

    /// Registers a task to be awaited on teardown.
    ///
    /// Returns `None` if the graph was already disposed.
    pub fn add_task(&self, task: TaskRef) -> Option<CleanupKey> {
        self.add(Entry::Task(task))
    }

    /// Detaches an entry without tearing it down.
    ///
    /// Returns false if the key is stale or belongs to another graph.
    pub fn release(&self, key: CleanupKey) -> bool {
        if key.graph != self.inner.id {
            return false;
        }
        let mut state = self.inner.state.lock();
        if state.entries.remove(key.index).is_none() {
            return false;
        }
        state.order[key.kind.slot()].retain(|index| *index != key.index);
        true
    }

    /// Returns the number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the graph was disposed or cleaned up.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Returns true if both handles refer to the same graph.
    #[must_use]
    pub fn same_graph(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Synchronous best-effort teardown of the plain disposables.
    ///
    /// Marks the graph disposed, then disposes each plain disposable newest
    /// first, swallowing failures. Cleanup handles and tasks stay queued for
    /// [`cleanup_async`](Self::cleanup_async).
    pub fn dispose_all_safe(&self) {
        let disposables = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            state.drain_reversed(EntryKind::Disposable)
        };
        if !disposables.is_empty() {
            tracing::debug!(
                graph = self.inner.id,
                count = disposables.len(),
                "disposing plain disposables"
            );
        }
        for entry in disposables {
            if let Entry::Disposable(disposable) = entry {
                self.inner.dispose_entry(disposable.as_ref());
            }
        }
        self.inner.cleanup.begin_dispose();
    }

    /// Full asynchronous teardown.
    ///
    /// Snapshots and clears every collection, then disposes plain disposables,
    /// awaits cleanup handles, and awaits bare tasks, each newest first.
    /// Failures are swallowed (and forwarded to the error sink, if any). A
    /// second or concurrent call waits for the first to finish. Dropping the
    /// returned future does not interrupt a teardown already under way.
    pub async fn cleanup_async(&self) {
        let inner = Arc::clone(&self.inner);
        let outcome = self
            .inner
            .cleanup
            .run_cleanup(move || async move {
                let (disposables, handles, tasks) = {
                    let mut state = inner.state.lock();
                    state.disposed = true;
                    (
                        state.drain_reversed(EntryKind::Disposable),
                        state.drain_reversed(EntryKind::Handle),
                        state.drain_reversed(EntryKind::Task),
                    )
                };
                tracing::debug!(
                    graph = inner.id,
                    disposables = disposables.len(),
                    handles = handles.len(),
                    tasks = tasks.len(),
                    "cleanup started"
                );
                for entry in disposables {
                    if let Entry::Disposable(disposable) = entry {
                        inner.dispose_entry(disposable.as_ref());
                    }
                }
                for entry in handles {
                    if let Entry::Handle(handle) = entry {
                        inner.cleanup_handle(handle.as_ref()).await;
                    }
                }
                for entry in tasks {
                    if let Entry::Task(task) = entry {
                        inner.await_task(&task).await;
                    }
                }
                tracing::debug!(graph = inner.id, "cleanup finished");
                Ok(())
            })
            .await;
        if let Err(err) = outcome {
            self.inner.report(err);
        }
    }

    /// Moves every pending entry of `other` into this graph.
    ///
    /// Moved entries keep their relative order and come after this graph's
    /// existing entries. `other` is left empty but usable. If this graph is
    /// already disposed the moved entries are torn down immediately. Merging
    /// a graph into itself does nothing.
    pub fn merge_from(&self, other: &Self) {
        if self.same_graph(other) {
            return;
        }
        let (mut ours, mut theirs) = lock_pair(&self.inner, &other.inner);
        let moved = theirs.drain_in_order();
        drop(theirs);
        let count = moved.len();
        if ours.disposed {
            drop(ours);
            for entry in moved {
                self.inner.tear_down_late(entry);
            }
        } else {
            for entry in moved {
                ours.insert(entry);
            }
        }
        tracing::debug!(from = other.inner.id, into = self.inner.id, count, "cleanup graphs merged");
    }
}

/// Locks two graphs in id order. Returns `(a, b)` guards in argument order.
fn lock_pair<'a>(
    a: &'a GraphInner,
    b: &'a GraphInner,
) -> (MutexGuard<'a, GraphState>, MutexGuard<'a, GraphState>) {
    if a.id < b.id {
        let first = a.state.lock();
        let second = b.state.lock();
        (first, second)
    } else {
        let first = b.state.lock();
        let second = a.state.lock();
        (second, first)
    }
}

impl Dispose for CleanupGraph {
    fn dispose(&self) {
        self.dispose_all_safe();
    }
}

impl AsyncCleanup for CleanupGraph {
    fn cleanup(&self) -> CleanupFuture {
        let graph = self.clone();
        Box::pin(async move {
            graph.cleanup_async().await;
            Ok(())
        })
    }
}

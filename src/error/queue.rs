//! Aggregation of background failures.
//!
//! An [`ErrorQueue`] collects errors from watched tasks and from explicit
//! reports into a capped, optionally deduplicating FIFO. The oldest entry is
//! the one re-raised. Queues merge on [`ErrorQueue::encounter`] the same way
//! [`SharedQueue`] does.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::{Error, Result};
use crate::runtime::{TaskCompletion, TaskRef};
use crate::shared::{MergeDomain, QueuePolicy, SharedQueue};
use crate::sync::{AsyncGate, CallbackId};

/// Error queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorQueueConfig {
    /// Most errors retained; the oldest is dropped beyond this.
    pub capacity: usize,
    /// Skip an error whose kind and message match a queued one.
    pub dedup: bool,
}

impl Default for ErrorQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            dedup: true,
        }
    }
}

impl ErrorQueueConfig {
    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enables or disables deduplication.
    #[must_use]
    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    /// Clamps inconsistent values.
    pub fn normalize(&mut self) {
        self.capacity = self.capacity.max(1);
    }
}

struct WatchedTask {
    task: TaskRef,
    callback: CallbackId,
}

impl WatchedTask {
    /// Detaches the completion callback and hands back the task.
    fn release(self) -> TaskRef {
        self.task.completion().remove_callback(self.callback);
        self.task
    }
}

#[derive(Default)]
struct Watched {
    tasks: Mutex<Vec<WatchedTask>>,
}

impl Watched {
    /// Removes and returns every finished task.
    fn take_finished(&self) -> Vec<TaskRef> {
        let finished: Vec<WatchedTask> = {
            let mut tasks = self.tasks.lock();
            let (done, pending) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|watched| watched.task.is_finished());
            *tasks = pending;
            done
        };
        finished.into_iter().map(WatchedTask::release).collect()
    }

    /// Removes the task owning `gate`, if still watched.
    fn take_by_gate(&self, gate: &AsyncGate) -> Option<TaskRef> {
        let watched = {
            let mut tasks = self.tasks.lock();
            let index = tasks
                .iter()
                .position(|watched| watched.task.completion().same_gate(gate))?;
            tasks.remove(index)
        };
        Some(watched.release())
    }
}

impl Drop for Watched {
    fn drop(&mut self) {
        for watched in self.tasks.get_mut().drain(..) {
            watched.release();
        }
    }
}

/// A capped, deduplicating, mergeable collection of errors.
#[derive(Clone)]
pub struct ErrorQueue {
    queue: SharedQueue<Error>,
    watched: Arc<Watched>,
    dedup: bool,
}

impl std::fmt::Debug for ErrorQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorQueue")
            .field("len", &self.len())
            .field("watched", &self.watched_count())
            .field("dedup", &self.dedup)
            .finish()
    }
}

impl Default for ErrorQueue {
    fn default() -> Self {
        Self::new(crate::config::global().error_queue.clone())
    }
}

impl ErrorQueue {
    /// Creates a queue in the global merge domain.
    #[must_use]
    pub fn new(config: ErrorQueueConfig) -> Self {
        Self::in_domain(MergeDomain::global(), config)
    }

    /// Creates a queue in `domain`.
    #[must_use]
    pub fn in_domain(domain: &MergeDomain, mut config: ErrorQueueConfig) -> Self {
        config.normalize();
        Self {
            queue: SharedQueue::in_domain(domain, config.capacity, QueuePolicy::DropOldest),
            watched: Arc::new(Watched::default()),
            dedup: config.dedup,
        }
    }

    /// Queues `err`, flattening aggregates into their leaves.
    ///
    /// Unless `skip_watched_check` is set, finished watched tasks are
    /// harvested first. With `raise_first`, returns the oldest queued error
    /// (not necessarily `err`) as `Err`.
    pub fn add(&self, err: Error, raise_first: bool, skip_watched_check: bool) -> Result<()> {
        if !skip_watched_check {
            self.harvest_finished();
        }
        for leaf in err.flatten() {
            self.push(leaf);
        }
        if raise_first {
            self.throw_first_if_exists()
        } else {
            Ok(())
        }
    }

    fn push(&self, err: Error) {
        let outcome = if self.dedup {
            self.queue.enqueue_unless(err, same_error).map(|_| ())
        } else {
            self.queue.enqueue(err).map(|_| ())
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "error queue refused an entry");
        }
    }

    /// Watches `task` and queues its fault once it fails.
    ///
    /// An already-finished task is harvested immediately.
    pub fn register_watched_task(&self, task: TaskRef) {
        if task.is_finished() {
            self.harvest(&task);
            return;
        }
        let gate = task.completion();
        let weak: Weak<Watched> = Arc::downgrade(&self.watched);
        let this = self.detached();
        let callback_gate = gate.clone();
        let callback = gate.on_set(move || {
            let Some(watched) = weak.upgrade() else {
                return;
            };
            if let Some(task) = watched.take_by_gate(&callback_gate) {
                this.harvest(&task);
            }
        });
        self.watched.tasks.lock().push(WatchedTask {
            task: task.clone(),
            callback,
        });

        // Finished between the check and the registration.
        if task.is_finished() {
            if let Some(task) = self.watched.take_by_gate(&gate) {
                self.harvest(&task);
            }
        }
    }

    /// A handle sharing the storage but not the watch list.
    fn detached(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            watched: Arc::new(Watched::default()),
            dedup: self.dedup,
        }
    }

    fn harvest(&self, task: &TaskRef) {
        if let Some(fault) = task.fault() {
            tracing::debug!(error = %fault, "harvested watched task fault");
            for leaf in fault.flatten() {
                self.push(leaf);
            }
        }
    }

    fn harvest_finished(&self) {
        for task in self.watched.take_finished() {
            self.harvest(&task);
        }
    }

    /// Harvests finished watched tasks, then returns the oldest queued error
    /// as `Err` if there is one.
    pub fn throw_first_if_exists(&self) -> Result<()> {
        self.harvest_finished();
        match self.queue.peek() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    /// Unites this queue's storage with `other`'s. Irreversible.
    pub fn encounter(&self, other: &Self) -> Result<bool> {
        self.queue.encounter(&other.queue)
    }

    /// Returns true if both queues share storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        self.queue.shares_storage_with(&other.queue)
    }

    /// Returns the number of queued errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if no error is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the number of tasks still being watched.
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.watched.tasks.lock().len()
    }

    /// Returns the oldest queued error.
    #[must_use]
    pub fn first(&self) -> Option<Error> {
        self.queue.peek()
    }

    /// Returns every queued error, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Error> {
        self.queue.to_vec()
    }

    /// Drops every queued error. Watched tasks stay watched.
    pub fn clear(&self) {
        self.queue.clear();
    }
}

fn same_error(a: &Error, b: &Error) -> bool {
    a.kind() == b.kind() && a.message() == b.message()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::{spawn, TaskHandle};
    use crate::sync::AsyncGate;
    use crate::test_utils::{init_test, wait_until};
    use std::time::Duration;

    fn isolated(config: ErrorQueueConfig) -> ErrorQueue {
        ErrorQueue::in_domain(&MergeDomain::new(), config)
    }

    #[test]
    fn aggregate_is_flattened_and_deduplicated() {
        init_test("aggregate_is_flattened_and_deduplicated");
        let queue = isolated(ErrorQueueConfig::default());
        let agg = Error::aggregate(vec![
            Error::user("a"),
            Error::aggregate(vec![Error::user("b"), Error::user("a")]),
        ]);
        queue.add(agg, false, true).expect("no raise");
        let messages: Vec<_> = queue
            .snapshot()
            .iter()
            .map(|e| e.message().unwrap_or_default().to_string())
            .collect();
        crate::assert_with_log!(
            messages == ["a", "b"],
            "flattened without duplicates",
            "[a, b]",
            messages
        );
        crate::test_complete!("aggregate_is_flattened_and_deduplicated");
    }

    #[test]
    fn completion_callback_is_detached_after_harvest() {
        init_test("completion_callback_is_detached_after_harvest");
        let queue = isolated(ErrorQueueConfig::default());
        let release = AsyncGate::new();
        let r = release.clone();
        let handle = spawn(async move {
            r.wait().await;
            Err::<(), _>(Error::user("late failure"))
        });
        let task = handle.task_ref();
        let before = task.completion().callback_count();
        queue.register_watched_task(task.clone());
        assert_eq!(task.completion().callback_count(), before + 1);

        release.set_now();
        assert!(wait_until(Duration::from_secs(5), || !queue.is_empty()));
        let remaining = task.completion().callback_count();
        crate::assert_with_log!(remaining == before, "callback removed", before, remaining);
        assert_eq!(queue.watched_count(), 0);
        crate::test_complete!("completion_callback_is_detached_after_harvest");
    }

    #[test]
    fn dropped_queue_detaches_pending_callbacks() {
        init_test("dropped_queue_detaches_pending_callbacks");
        let release = AsyncGate::new();
        let r = release.clone();
        let handle = spawn(async move {
            r.wait().await;
            Ok(())
        });
        let task = handle.task_ref();
        let before = task.completion().callback_count();
        let queue = isolated(ErrorQueueConfig::default());
        queue.register_watched_task(task.clone());
        drop(queue);
        let remaining = task.completion().callback_count();
        crate::assert_with_log!(remaining == before, "callback removed", before, remaining);
        release.set_now();
        crate::test_complete!("dropped_queue_detaches_pending_callbacks");
    }

    #[test]
    fn raise_first_returns_oldest() {
        init_test("raise_first_returns_oldest");
        let queue = isolated(ErrorQueueConfig::default());
        queue.add(Error::user("old"), false, true).expect("no raise");
        let err = queue
            .add(Error::user("new"), true, true)
            .expect_err("raises");
        assert_eq!(err.message(), Some("old"));
        assert_eq!(queue.len(), 2);
        crate::test_complete!("raise_first_returns_oldest");
    }

    #[test]
    fn capacity_drops_oldest() {
        init_test("capacity_drops_oldest");
        let queue = isolated(ErrorQueueConfig::default().with_capacity(2).with_dedup(false));
        for msg in ["1", "2", "3"] {
            queue.add(Error::user(msg), false, true).expect("no raise");
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.first().and_then(|e| e.message().map(String::from)), Some("2".into()));
        crate::test_complete!("capacity_drops_oldest");
    }

    #[test]
    fn finished_task_harvested_immediately() {
        init_test("finished_task_harvested_immediately");
        let queue = isolated(ErrorQueueConfig::default());
        let failed: TaskHandle<()> = TaskHandle::failed(Error::user("boom"));
        queue.register_watched_task(failed.task_ref());
        let err = queue.throw_first_if_exists().expect_err("harvested");
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(queue.watched_count(), 0);

        let ok: TaskHandle<()> = TaskHandle::ready(());
        queue.clear();
        queue.register_watched_task(ok.task_ref());
        assert!(queue.throw_first_if_exists().is_ok());
        crate::test_complete!("finished_task_harvested_immediately");
    }

    #[test]
    fn running_task_harvested_on_completion() {
        init_test("running_task_harvested_on_completion");
        let queue = isolated(ErrorQueueConfig::default());
        let gate = AsyncGate::new();
        let wait = gate.wait();
        let handle = spawn(async move {
            wait.await;
            Err::<(), _>(Error::user("late failure"))
        });
        queue.register_watched_task(handle.task_ref());
        assert_eq!(queue.watched_count(), 1);
        assert!(queue.is_empty());

        gate.set_now();
        let harvested = wait_until(Duration::from_secs(5), || queue.len() == 1);
        crate::assert_with_log!(harvested, "fault harvested", 1usize, queue.len());
        assert_eq!(queue.watched_count(), 0);
        crate::test_complete!("running_task_harvested_on_completion");
    }

    #[test]
    fn merged_queues_observe_one_set() {
        init_test("merged_queues_observe_one_set");
        let domain = MergeDomain::new();
        let a = ErrorQueue::in_domain(&domain, ErrorQueueConfig::default());
        let b = ErrorQueue::in_domain(&domain, ErrorQueueConfig::default());
        a.add(Error::user("from a"), false, true).expect("no raise");
        b.add(Error::user("from b"), false, true).expect("no raise");
        assert!(a.encounter(&b).expect("same domain"));
        b.add(Error::user("after"), false, true).expect("no raise");
        assert_eq!(a.len(), 3);
        assert!(a.shares_storage_with(&b));
        assert_eq!(b.first().and_then(|e| e.message().map(String::from)), Some("from a".into()));
        crate::test_complete!("merged_queues_observe_one_set");
    }
}

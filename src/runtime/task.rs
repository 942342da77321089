//! Spawned tasks and their handles.
//!
//! A task is a boxed future driven on the executor's [`WorkerPool`]. Waking a
//! task schedules exactly one poll on the pool; wakes that arrive while a
//! poll is queued are coalesced.
//!
//! Every task owns a completion [`AsyncGate`] that is set once the task
//! reaches a terminal [`TaskStatus`]. Waiters that do not need the task's
//! value (the wait combinator, the cleanup graph, the error queue) observe it
//! through the object-safe [`TaskCompletion`] trait.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use super::WorkerPool;
use crate::error::{Error, ErrorKind, Result};
use crate::sync::{AsyncGate, GateWait};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Terminal and non-terminal states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Still running.
    Running,
    /// Finished with a value.
    Completed,
    /// Finished with an error or a panic.
    Faulted,
    /// Aborted, or finished with a cancellation error.
    Canceled,
}

impl TaskStatus {
    /// Returns true for every state except [`TaskStatus::Running`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Completion observation for a task, independent of its output type.
pub trait TaskCompletion: Send + Sync {
    /// Returns the current status.
    fn status(&self) -> TaskStatus;

    /// Returns the fault (or cancellation error) once the task failed.
    fn fault(&self) -> Option<Error>;

    /// Returns the gate that is set once the task is terminal.
    fn completion(&self) -> AsyncGate;

    /// Returns true once the task reached a terminal state.
    fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns true if the task faulted or was canceled.
    fn is_failed(&self) -> bool {
        matches!(self.status(), TaskStatus::Faulted | TaskStatus::Canceled)
    }
}

/// Status shared between a task and everything observing it.
struct TaskCore {
    state: Mutex<(TaskStatus, Option<Error>)>,
    done: AsyncGate,
    aborted: AtomicBool,
    task: Mutex<Weak<Task>>,
}

impl TaskCore {
    fn new() -> Self {
        Self {
            state: Mutex::new((TaskStatus::Running, None)),
            done: AsyncGate::new(),
            aborted: AtomicBool::new(false),
            task: Mutex::new(Weak::new()),
        }
    }

    /// Records the terminal state. Returns false if already terminal.
    fn finish(&self, status: TaskStatus, fault: Option<Error>) -> bool {
        {
            let mut state = self.state.lock();
            if state.0.is_terminal() {
                return false;
            }
            *state = (status, fault);
        }
        self.done.set_now();
        true
    }
}

impl TaskCompletion for TaskCore {
    fn status(&self) -> TaskStatus {
        self.state.lock().0
    }

    fn fault(&self) -> Option<Error> {
        self.state.lock().1.clone()
    }

    fn completion(&self) -> AsyncGate {
        self.done.clone()
    }
}

/// A scheduled unit of work.
struct Task {
    future: Mutex<Option<BoxFuture>>,
    scheduled: AtomicBool,
    core: Arc<TaskCore>,
    pool: WorkerPool,
}

impl Task {
    fn schedule(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            let task = Arc::clone(self);
            self.pool.execute(move || task.run());
        }
    }

    fn run(self: Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);
        let mut slot = self.future.lock();
        if self.core.aborted.load(Ordering::Acquire) {
            slot.take();
            return;
        }
        let Some(future) = slot.as_mut() else {
            return;
        };

        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);
        match catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {}
            Ok(Poll::Ready(())) => {
                slot.take();
            }
            Err(payload) => {
                slot.take();
                drop(slot);
                let err = Error::from_panic(payload.as_ref());
                tracing::warn!(error = %err, "task panicked");
                self.core.finish(TaskStatus::Faulted, Some(err));
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// A cloneable, type-erased view of a task's completion.
#[derive(Clone)]
pub struct TaskRef {
    core: Arc<TaskCore>,
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("status", &self.status())
            .finish()
    }
}

impl TaskCompletion for TaskRef {
    fn status(&self) -> TaskStatus {
        self.core.status()
    }

    fn fault(&self) -> Option<Error> {
        self.core.fault()
    }

    fn completion(&self) -> AsyncGate {
        self.core.completion()
    }
}

impl TaskRef {
    /// Returns a future that resolves once the task is terminal.
    pub fn wait(&self) -> GateWait {
        self.core.done.wait()
    }
}

/// Owned handle to a spawned task.
///
/// Awaiting the handle yields the task's result. Dropping the handle detaches
/// the task; it keeps running.
pub struct TaskHandle<T> {
    core: Arc<TaskCore>,
    output: Arc<Mutex<Option<T>>>,
    waiter: Option<GateWait>,
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("status", &self.status())
            .finish()
    }
}

impl<T> TaskHandle<T> {
    /// Creates a handle that is already completed with `value`.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let core = Arc::new(TaskCore::new());
        core.finish(TaskStatus::Completed, None);
        Self {
            core,
            output: Arc::new(Mutex::new(Some(value))),
            waiter: None,
        }
    }

    /// Creates a handle that has already failed with `error`.
    ///
    /// A cancellation error produces a [`TaskStatus::Canceled`] handle.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        let core = Arc::new(TaskCore::new());
        let status = failure_status(&error);
        core.finish(status, Some(error));
        Self {
            core,
            output: Arc::new(Mutex::new(None)),
            waiter: None,
        }
    }

    /// Returns a cloneable completion view of this task.
    #[must_use]
    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            core: Arc::clone(&self.core),
        }
    }

    /// Aborts the task.
    ///
    /// The task is marked [`TaskStatus::Canceled`] immediately and its future
    /// is dropped on the executor without being polled again. Aborting a
    /// finished task does nothing.
    pub fn abort(&self) {
        self.core.aborted.store(true, Ordering::Release);
        let aborted = self.core.finish(
            TaskStatus::Canceled,
            Some(Error::new(ErrorKind::Cancelled).with_message("task aborted")),
        );
        if aborted {
            if let Some(task) = self.core.task.lock().upgrade() {
                task.schedule();
            }
        }
    }

    /// Waits for the task and returns its result.
    pub async fn join(self) -> Result<T> {
        self.await
    }
}

impl<T> TaskCompletion for TaskHandle<T>
where
    T: Send,
{
    fn status(&self) -> TaskStatus {
        self.core.status()
    }

    fn fault(&self) -> Option<Error> {
        self.core.fault()
    }

    fn completion(&self) -> AsyncGate {
        self.core.completion()
    }
}

impl<T> TaskHandle<T> {
    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.core.status()
    }

    /// Returns true once the task reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.status().is_terminal()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.core.done.is_set() {
            let core = Arc::clone(&self.core);
            let waiter = self.waiter.get_or_insert_with(|| core.done.wait());
            if Pin::new(waiter).poll(cx).is_pending() {
                return Poll::Pending;
            }
        }
        self.waiter = None;

        let (status, fault) = self.core.state.lock().clone();
        let result = match status {
            TaskStatus::Completed => self
                .output
                .lock()
                .take()
                .ok_or_else(|| Error::misuse("task output already taken")),
            _ => Err(fault.unwrap_or_else(|| Error::internal("task failed without a fault"))),
        };
        Poll::Ready(result)
    }
}

fn failure_status(error: &Error) -> TaskStatus {
    if error.is_cancelled() {
        TaskStatus::Canceled
    } else {
        TaskStatus::Faulted
    }
}

/// Spawns a task on the given pool.
pub(crate) fn spawn_on<F, T>(pool: &WorkerPool, future: F) -> TaskHandle<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let core = Arc::new(TaskCore::new());
    let output = Arc::new(Mutex::new(None));

    let wrapped = {
        let core = Arc::clone(&core);
        let output = Arc::clone(&output);
        async move {
            match future.await {
                Ok(value) => {
                    *output.lock() = Some(value);
                    core.finish(TaskStatus::Completed, None);
                }
                Err(err) => {
                    core.finish(failure_status(&err), Some(err));
                }
            }
        }
    };

    let task = Arc::new(Task {
        future: Mutex::new(Some(Box::pin(wrapped))),
        scheduled: AtomicBool::new(false),
        core: Arc::clone(&core),
        pool: pool.clone(),
    });
    *core.task.lock() = Arc::downgrade(&task);
    task.schedule();

    TaskHandle {
        core,
        output,
        waiter: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{block_on, spawn};
    use crate::test_utils::{init_test, poll_once, wait_until};
    use std::time::Duration;

    #[test]
    fn spawned_task_yields_value() {
        init_test("spawned_task_yields_value");
        let handle = spawn(async { Ok(21 * 2) });
        let value = block_on(handle.join()).expect("task failed");
        crate::assert_with_log!(value == 42, "value returned", 42, value);
        crate::test_complete!("spawned_task_yields_value");
    }

    #[test]
    fn error_result_faults_task() {
        init_test("error_result_faults_task");
        let handle = spawn(async { Err::<(), _>(Error::user("broken")) });
        let task = handle.task_ref();
        let err = block_on(handle).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(task.status(), TaskStatus::Faulted);
        assert_eq!(task.fault().and_then(|e| e.message().map(String::from)), Some("broken".into()));
        crate::test_complete!("error_result_faults_task");
    }

    #[test]
    fn panicking_task_is_faulted() {
        init_test("panicking_task_is_faulted");
        let handle = spawn(async {
            if true {
                panic!("task blew up");
            }
            Ok(())
        });
        let err = block_on(handle).expect_err("should fail");
        crate::assert_with_log!(
            err.kind() == ErrorKind::TaskPanicked,
            "panic captured",
            ErrorKind::TaskPanicked,
            err.kind()
        );
        crate::test_complete!("panicking_task_is_faulted");
    }

    #[test]
    fn cancellation_error_marks_canceled() {
        init_test("cancellation_error_marks_canceled");
        let handle = TaskHandle::<()>::failed(Error::cancelled(&crate::types::CancelReason::user("stop")));
        assert_eq!(handle.status(), TaskStatus::Canceled);
        assert!(handle.is_failed());
        crate::test_complete!("cancellation_error_marks_canceled");
    }

    #[test]
    fn abort_cancels_pending_task() {
        init_test("abort_cancels_pending_task");
        let gate = AsyncGate::new();
        let g = gate.clone();
        let handle = spawn(async move {
            g.wait().await;
            Ok(1)
        });
        let task = handle.task_ref();
        assert!(!task.is_finished());

        handle.abort();
        assert_eq!(task.status(), TaskStatus::Canceled);
        gate.set_now();

        let err = block_on(handle).expect_err("aborted");
        assert!(err.is_cancelled());
        crate::test_complete!("abort_cancels_pending_task");
    }

    #[test]
    fn ready_handle_resolves_without_executor() {
        init_test("ready_handle_resolves_without_executor");
        let mut handle = TaskHandle::ready("done");
        assert!(handle.is_finished());
        let polled = poll_once(&mut handle);
        assert!(matches!(polled, Poll::Ready(Ok("done"))));
        crate::test_complete!("ready_handle_resolves_without_executor");
    }

    #[test]
    fn task_ref_wait_observes_completion() {
        init_test("task_ref_wait_observes_completion");
        let gate = AsyncGate::new();
        let g = gate.clone();
        let handle = spawn(async move {
            g.wait().await;
            Ok(())
        });
        let task = handle.task_ref();
        drop(handle);
        gate.set_now();
        let finished = wait_until(Duration::from_secs(5), || task.is_finished());
        crate::assert_with_log!(finished, "detached task finished", true, finished);
        assert_eq!(task.status(), TaskStatus::Completed);
        crate::test_complete!("task_ref_wait_observes_completion");
    }
}

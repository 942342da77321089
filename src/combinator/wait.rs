//! Wait-for-any across tasks, cancellation signals, events and a timeout.
//!
//! [`wait_objects`] turns an arbitrary mix of inputs into one await point and
//! reports which *category* of condition ended the wait.
//!
//! # Evaluation
//!
//! 1. Fast exit without suspending, in order: `timeout == 0`, any task already
//!    faulted or canceled, any signal already cancelled.
//! 2. Otherwise one branch per input is polled in a fixed order and the first
//!    ready branch wins the race.
//! 3. On wake the conditions that hold *now* are classified in priority
//!    order: timeout, failed tasks, cancelled signals. If none holds, an
//!    event or a successfully completed task woke us and the result is
//!    [`WakeReason::None`].
//!
//! Each classified condition is either returned or raised as an error,
//! according to the [`ExceptionPolicy`] flags.
//!
//! # Cancel Safety
//!
//! Losing branches are dropped before the result is produced, whether it is
//! returned or raised. A pulse branch that was handed a credit it never
//! observed passes the credit on, and gate branches release their slots.

use bitflags::bitflags;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::cancel::{CancellationSignal, Cancelled};
use crate::error::{Error, Result};
use crate::runtime::TaskCompletion;
use crate::sync::{AsyncGate, AsyncPulse, GateWait, PulseWait};
use crate::time::{Delay, DelayScheduler, Delayer, INFINITE};

bitflags! {
    /// Which classified wake conditions are raised as errors instead of
    /// being returned as a [`WakeReason`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionPolicy: u8 {
        /// Raise the first cause of a faulted or canceled task.
        const TASK = 1;
        /// Raise `Cancelled` for a cancelled signal.
        const CANCEL = 1 << 1;
        /// Raise `Timeout` when the timeout elapsed.
        const TIMEOUT = 1 << 2;
    }
}

impl Default for ExceptionPolicy {
    fn default() -> Self {
        Self::all()
    }
}

/// Why a [`wait_objects`] call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeReason {
    /// An event fired or a task completed successfully.
    None,
    /// The timeout elapsed.
    Timeout,
    /// A task faulted or was canceled.
    TaskFaulted,
    /// A cancellation signal fired.
    Cancelled,
}

/// Builder for a wait over borrowed inputs.
///
/// ```ignore
/// let reason = WaitObjects::new()
///     .cancel(&signal)
///     .gate(&ready)
///     .timeout(500)
///     .policy(ExceptionPolicy::TASK)
///     .wait()
///     .await?;
/// ```
#[must_use = "a wait does nothing until `wait` is awaited"]
pub struct WaitObjects<'a> {
    tasks: Vec<&'a dyn TaskCompletion>,
    cancels: Vec<&'a CancellationSignal>,
    pulses: Vec<&'a AsyncPulse>,
    gates: Vec<&'a AsyncGate>,
    timeout_ms: i64,
    policy: ExceptionPolicy,
    delayer: Option<&'a dyn Delayer>,
}

impl Default for WaitObjects<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WaitObjects<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitObjects")
            .field("tasks", &self.tasks.len())
            .field("cancels", &self.cancels.len())
            .field("pulses", &self.pulses.len())
            .field("gates", &self.gates.len())
            .field("timeout_ms", &self.timeout_ms)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<'a> WaitObjects<'a> {
    /// An empty wait with no timeout and every category raised.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancels: Vec::new(),
            pulses: Vec::new(),
            gates: Vec::new(),
            timeout_ms: INFINITE,
            policy: ExceptionPolicy::all(),
            delayer: None,
        }
    }

    /// Adds a task.
    pub fn task(mut self, task: &'a dyn TaskCompletion) -> Self {
        self.tasks.push(task);
        self
    }

    /// Adds several tasks.
    pub fn tasks(mut self, tasks: impl IntoIterator<Item = &'a dyn TaskCompletion>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Adds a cancellation signal.
    pub fn cancel(mut self, signal: &'a CancellationSignal) -> Self {
        self.cancels.push(signal);
        self
    }

    /// Adds several cancellation signals.
    pub fn cancels(mut self, signals: impl IntoIterator<Item = &'a CancellationSignal>) -> Self {
        self.cancels.extend(signals);
        self
    }

    /// Adds an auto-reset event.
    pub fn pulse(mut self, pulse: &'a AsyncPulse) -> Self {
        self.pulses.push(pulse);
        self
    }

    /// Adds several auto-reset events.
    pub fn pulses(mut self, pulses: impl IntoIterator<Item = &'a AsyncPulse>) -> Self {
        self.pulses.extend(pulses);
        self
    }

    /// Adds a manual-reset event.
    pub fn gate(mut self, gate: &'a AsyncGate) -> Self {
        self.gates.push(gate);
        self
    }

    /// Adds several manual-reset events.
    pub fn gates(mut self, gates: impl IntoIterator<Item = &'a AsyncGate>) -> Self {
        self.gates.extend(gates);
        self
    }

    /// Sets the timeout in milliseconds.
    ///
    /// `0` times out without suspending; any negative value, including
    /// [`INFINITE`], never times out.
    pub fn timeout(mut self, ms: i64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Sets which conditions are raised as errors.
    pub fn policy(mut self, policy: ExceptionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `delayer` for the timeout instead of the process-wide scheduler.
    pub fn delayer(mut self, delayer: &'a dyn Delayer) -> Self {
        self.delayer = Some(delayer);
        self
    }

    /// Waits for the first condition and classifies it.
    pub async fn wait(self) -> Result<WakeReason> {
        if self.timeout_ms == 0 {
            return self.classify(WakeReason::Timeout);
        }
        if self.tasks.iter().any(|task| task.is_failed()) {
            return self.classify(WakeReason::TaskFaulted);
        }
        if self.cancels.iter().any(|signal| signal.is_cancelled()) {
            return self.classify(WakeReason::Cancelled);
        }

        let delayer: &dyn Delayer = match self.delayer {
            Some(delayer) => delayer,
            None => DelayScheduler::global(),
        };
        let deadline = (self.timeout_ms > 0).then(|| {
            delayer
                .now()
                .saturating_add_millis(self.timeout_ms.unsigned_abs())
        });

        let mut branches: SmallVec<[Branch; 4]> = SmallVec::new();
        branches.extend(
            self.tasks
                .iter()
                .map(|task| Branch::Task(task.completion().wait())),
        );
        branches.extend(self.cancels.iter().map(|s| Branch::Cancel(s.cancelled())));
        branches.extend(self.pulses.iter().map(|p| Branch::Pulse(p.wait())));
        branches.extend(self.gates.iter().map(|g| Branch::Gate(g.wait())));
        if deadline.is_some() {
            branches.push(Branch::Timeout(delayer.delay(self.timeout_ms)));
        }

        let winner = FirstReady { branches }.await;
        tracing::trace!(winner = ?winner, "wait objects woke");

        let timed_out = winner == BranchKind::Timeout
            || deadline.is_some_and(|deadline| delayer.now() >= deadline);
        let reason = if timed_out {
            WakeReason::Timeout
        } else if self.tasks.iter().any(|task| task.is_failed()) {
            WakeReason::TaskFaulted
        } else if self.cancels.iter().any(|signal| signal.is_cancelled()) {
            WakeReason::Cancelled
        } else {
            WakeReason::None
        };
        self.classify(reason)
    }

    fn classify(&self, reason: WakeReason) -> Result<WakeReason> {
        match reason {
            WakeReason::Timeout if self.policy.contains(ExceptionPolicy::TIMEOUT) => {
                Err(Error::timeout(self.timeout_ms))
            }
            WakeReason::TaskFaulted if self.policy.contains(ExceptionPolicy::TASK) => {
                let fault = self
                    .tasks
                    .iter()
                    .filter(|task| task.is_failed())
                    .find_map(|task| task.fault())
                    .map_or_else(
                        || Error::internal("task failed without a fault"),
                        |fault| fault.first_cause(),
                    );
                Err(fault)
            }
            WakeReason::Cancelled if self.policy.contains(ExceptionPolicy::CANCEL) => {
                let reason = self
                    .cancels
                    .iter()
                    .find_map(|signal| signal.reason())
                    .unwrap_or_default();
                Err(Error::cancelled(&reason))
            }
            reason => Ok(reason),
        }
    }
}

/// Waits for the first of `tasks`, `cancels`, `pulses`, `gates` or the
/// timeout, on the process-wide delay scheduler.
///
/// See the [module documentation](self) for the evaluation order.
pub async fn wait_objects(
    tasks: &[&dyn TaskCompletion],
    cancels: &[CancellationSignal],
    pulses: &[AsyncPulse],
    gates: &[AsyncGate],
    timeout_ms: i64,
    policy: ExceptionPolicy,
) -> Result<WakeReason> {
    WaitObjects::new()
        .tasks(tasks.iter().copied())
        .cancels(cancels)
        .pulses(pulses)
        .gates(gates)
        .timeout(timeout_ms)
        .policy(policy)
        .wait()
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    Task,
    Cancel,
    Pulse,
    Gate,
    Timeout,
}

#[derive(Debug)]
enum Branch {
    Task(GateWait),
    Cancel(Cancelled),
    Pulse(PulseWait),
    Gate(GateWait),
    Timeout(Delay),
}

impl Branch {
    fn kind(&self) -> BranchKind {
        match self {
            Self::Task(_) => BranchKind::Task,
            Self::Cancel(_) => BranchKind::Cancel,
            Self::Pulse(_) => BranchKind::Pulse,
            Self::Gate(_) => BranchKind::Gate,
            Self::Timeout(_) => BranchKind::Timeout,
        }
    }

    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match self {
            Self::Task(wait) | Self::Gate(wait) => Pin::new(wait).poll(cx),
            Self::Cancel(wait) => Pin::new(wait).poll(cx),
            Self::Pulse(wait) => Pin::new(wait).poll(cx),
            Self::Timeout(wait) => Pin::new(wait).poll(cx),
        }
    }
}

/// Resolves with the kind of the first ready branch; drops every branch
/// when it resolves.
struct FirstReady {
    branches: SmallVec<[Branch; 4]>,
}

impl Future for FirstReady {
    type Output = BranchKind;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<BranchKind> {
        let ready = self
            .branches
            .iter_mut()
            .find_map(|branch| branch.poll(cx).is_ready().then(|| branch.kind()));
        match ready {
            Some(kind) => {
                self.branches.clear();
                Poll::Ready(kind)
            }
            None => Poll::Pending,
        }
    }
}

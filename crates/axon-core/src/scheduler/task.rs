//! Task records and their state machine.
//!
//! A task is created by `submit`, owned by the scheduler for its whole life,
//! and observed from the outside only through its id, its wait handle and
//! its callback. Status moves along a fixed set of edges:
//!
//! ```text
//! Pending -> Ready -> Running -> Completed | Failed | Cancelled
//! Pending -> Cancelled        Ready -> Cancelled
//! ```
//!
//! Terminal transitions happen exactly once. The transition writes the end
//! time, fills the result slot, fulfills the wait handle and only then hands
//! the callback to the caller for invocation, so every observer sees a fully
//! formed result.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Error;
use crate::model::ModelRef;
use crate::tensor::Tensor;

/// Unique, monotonically increasing task identifier. Never zero.
pub type TaskId = u64;

/// Scheduling priority. `Critical` outranks everything; ties within a
/// priority are broken first-come first-served.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Terminal outcome of a task, delivered to waiters and callbacks.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub outputs: Vec<Tensor>,
    /// Wall time spent between the running and terminal transitions. Zero
    /// for tasks cancelled before they started.
    pub execution_time: Duration,
    pub error: Option<Error>,
}

impl TaskResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Single-shot completion callback.
///
/// Callbacks run on the thread that performs the task's terminal transition
/// (a worker, the scheduler driver, or a cancelling caller). They must not
/// block and must not synchronously submit follow-up work on the same
/// dependency chain.
pub type TaskCallback = Box<dyn FnOnce(&TaskResult) + Send>;

/// Rendezvous between a task and its synchronous waiters.
#[derive(Clone, Default)]
pub(crate) struct WaitHandle {
    inner: Arc<WaitInner>,
}

#[derive(Default)]
struct WaitInner {
    slot: Mutex<Option<TaskResult>>,
    cond: Condvar,
}

impl WaitHandle {
    /// Publish the result. Later calls are ignored; the first write wins.
    pub(crate) fn fulfill(&self, result: TaskResult) {
        let mut slot = self.inner.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.inner.cond.notify_all();
        }
    }

    /// Block until the result is published or `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Option<TaskResult> {
        let mut slot = self.inner.slot.lock();
        match timeout {
            None => {
                while slot.is_none() {
                    self.inner.cond.wait(&mut slot);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while slot.is_none() {
                    if self.inner.cond.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        slot.clone()
    }

    /// Non-blocking snapshot of the result slot.
    pub(crate) fn peek(&self) -> Option<TaskResult> {
        self.inner.slot.lock().clone()
    }
}

struct TaskState {
    status: TaskStatus,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    /// When the task entered the ready queue; feeds queue-wait profiling.
    ready_at: Option<Instant>,
}

/// A single inference request. Records are created and driven by the
/// scheduler; other code observes them through accessors.
pub struct Task {
    id: TaskId,
    model: ModelRef,
    inputs: Vec<Tensor>,
    priority: Priority,
    dependencies: HashSet<TaskId>,
    timeout: Option<Duration>,
    /// FIFO tie-break within a priority; stamped when the task turns Ready.
    enqueue_seq: AtomicU64,
    cancel_requested: AtomicBool,
    /// A waiter saw the terminal result; makes the task eligible for
    /// immediate reaping.
    observed: AtomicBool,
    state: Mutex<TaskState>,
    callback: Mutex<Option<TaskCallback>>,
    wait: WaitHandle,
}

impl Task {
    pub fn new(
        id: TaskId,
        model: ModelRef,
        inputs: Vec<Tensor>,
        priority: Priority,
        dependencies: HashSet<TaskId>,
        timeout: Option<Duration>,
        callback: Option<TaskCallback>,
    ) -> Self {
        Self {
            id,
            model,
            inputs,
            priority,
            dependencies,
            timeout,
            enqueue_seq: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
            observed: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                start_time: None,
                end_time: None,
                ready_at: None,
            }),
            callback: Mutex::new(callback),
            wait: WaitHandle::default(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn dependencies(&self) -> &HashSet<TaskId> {
        &self.dependencies
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn enqueue_seq(&self) -> u64 {
        self.enqueue_seq.load(Ordering::Acquire)
    }

    pub(crate) fn wait_handle(&self) -> WaitHandle {
        self.wait.clone()
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_observed(&self) {
        self.observed.store(true, Ordering::Release);
    }

    pub(crate) fn observed(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }

    /// When the task reached its terminal state, if it has.
    pub(crate) fn terminal_at(&self) -> Option<Instant> {
        let state = self.state.lock();
        if state.status.is_terminal() {
            state.end_time
        } else {
            None
        }
    }

    /// `Pending -> Ready`, stamping the FIFO sequence number.
    pub(crate) fn mark_ready(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Pending {
            return false;
        }
        state.status = TaskStatus::Ready;
        state.ready_at = Some(Instant::now());
        self.enqueue_seq.store(seq, Ordering::Release);
        true
    }

    /// `Ready -> Running`. Returns `false` if another transition won (the
    /// task was cancelled while queued).
    pub(crate) fn claim_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Ready {
            return false;
        }
        state.status = TaskStatus::Running;
        state.start_time = Some(Instant::now());
        true
    }

    /// Queue residency of a task that has started running.
    pub(crate) fn queue_wait(&self) -> Option<Duration> {
        let state = self.state.lock();
        match (state.ready_at, state.start_time) {
            (Some(ready), Some(start)) => Some(start.duration_since(ready)),
            _ => None,
        }
    }

    /// Perform the terminal transition.
    ///
    /// Returns the published result, or `None` if the task was already
    /// terminal (a racing finisher won). On `Some`, the result slot and the
    /// wait handle are already filled; the caller should follow up with
    /// [`invoke_callback`](Self::invoke_callback).
    pub(crate) fn finish(
        &self,
        status: TaskStatus,
        outputs: Vec<Tensor>,
        error: Option<Error>,
    ) -> Option<TaskResult> {
        debug_assert!(status.is_terminal());
        let result = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return None;
            }
            let now = Instant::now();
            state.status = status;
            state.end_time = Some(now);
            let execution_time = state
                .start_time
                .map(|start| now.duration_since(start))
                .unwrap_or_default();
            TaskResult {
                task_id: self.id,
                status,
                outputs,
                execution_time,
                error,
            }
        };
        self.wait.fulfill(result.clone());
        Some(result)
    }

    /// `Pending | Ready -> Cancelled`, if a worker has not claimed the task
    /// yet. Running and terminal tasks are left untouched.
    pub(crate) fn try_cancel_now(&self, error: Error) -> Option<TaskResult> {
        {
            let state = self.state.lock();
            if !matches!(state.status, TaskStatus::Pending | TaskStatus::Ready) {
                return None;
            }
        }
        self.finish(TaskStatus::Cancelled, Vec::new(), Some(error))
    }

    /// Run the callback, if one is attached and has not fired yet. Panics
    /// from the callback are contained here; they never reach the worker.
    pub(crate) fn invoke_callback(&self, result: &TaskResult) {
        let Some(callback) = self.callback.lock().take() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
            error!(task_id = self.id, "task callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoadOptions, Model, ModelMetadata};
    use crate::Result;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    struct InertModel;

    impl Model for InertModel {
        fn initialize(&mut self, _path: &Path, _options: &LoadOptions) -> Result<()> {
            Ok(())
        }

        fn infer(&self, _inputs: &[Tensor]) -> Result<Vec<Tensor>> {
            Ok(vec![])
        }

        fn shutdown(&self) {}

        fn metadata(&self) -> ModelMetadata {
            ModelMetadata::default()
        }

        fn is_initialized(&self) -> bool {
            true
        }

        fn memory_usage(&self) -> usize {
            0
        }
    }

    fn task(id: TaskId) -> Task {
        Task::new(
            id,
            Arc::new(InertModel),
            vec![],
            Priority::Normal,
            HashSet::new(),
            None,
            None,
        )
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn test_state_machine_happy_path() {
        let t = task(1);
        assert_eq!(t.status(), TaskStatus::Pending);
        assert!(t.mark_ready(7));
        assert_eq!(t.status(), TaskStatus::Ready);
        assert_eq!(t.enqueue_seq(), 7);
        assert!(t.claim_running());
        assert_eq!(t.status(), TaskStatus::Running);
        let result = t.finish(TaskStatus::Completed, vec![], None).unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(t.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_illegal_edges_rejected() {
        let t = task(1);
        assert!(!t.claim_running(), "Pending -> Running is not an edge");
        t.mark_ready(1);
        assert!(!t.mark_ready(2), "Ready -> Ready is not an edge");
    }

    #[test]
    fn test_finish_is_single_shot() {
        let t = task(1);
        assert!(t.finish(TaskStatus::Cancelled, vec![], Some(Error::Cancelled)).is_some());
        assert!(t.finish(TaskStatus::Completed, vec![], None).is_none());
        assert_eq!(t.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_try_cancel_now_only_before_claim() {
        let t = task(1);
        t.mark_ready(1);
        t.claim_running();
        assert!(t.try_cancel_now(Error::Cancelled).is_none());
        assert_eq!(t.status(), TaskStatus::Running);
    }

    #[test]
    fn test_wait_handle_delivers_after_fulfill() {
        let t = task(9);
        let handle = t.wait_handle();
        assert!(handle.peek().is_none());
        assert!(handle.wait(Some(Duration::from_millis(10))).is_none());

        let result = t.finish(TaskStatus::Completed, vec![], None).unwrap();
        let seen = handle.wait(None).unwrap();
        assert_eq!(seen.task_id, result.task_id);
        // Waiting again returns the same result immediately.
        assert!(handle.wait(Some(Duration::ZERO)).is_some());
    }

    #[test]
    fn test_wait_handle_wakes_blocked_waiter() {
        let t = Arc::new(task(3));
        let handle = t.wait_handle();
        let waiter = std::thread::spawn(move || handle.wait(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        t.finish(TaskStatus::Failed, vec![], Some(Error::Timeout));
        let seen = waiter.join().unwrap().unwrap();
        assert_eq!(seen.status, TaskStatus::Failed);
    }

    #[test]
    fn test_callback_fires_once_and_contains_panics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let t = Task::new(
            4,
            Arc::new(InertModel),
            vec![],
            Priority::High,
            HashSet::new(),
            None,
            Some(Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
                panic!("callback blew up");
            })),
        );
        let result = t.finish(TaskStatus::Completed, vec![], None).unwrap();
        t.invoke_callback(&result);
        t.invoke_callback(&result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_has_dependencies() {
        let no_deps = task(1);
        assert!(!no_deps.has_dependencies());
        let with_deps = Task::new(
            2,
            Arc::new(InertModel),
            vec![],
            Priority::Normal,
            HashSet::from([1]),
            None,
            None,
        );
        assert!(with_deps.has_dependencies());
    }
}

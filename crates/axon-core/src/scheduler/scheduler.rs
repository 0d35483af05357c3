//! Scheduler orchestrator.
//!
//! Owns the dependency graph, the ready queue and the worker pool, and runs
//! a dedicated driver thread that reacts to submissions and completions:
//! it publishes ready deltas from the graph to the queue, dispatches up to
//! `num_threads` tasks at a time to the pool, cascades failures downstream
//! and reaps terminal tasks past their retention window.
//!
//! Submitters interact through ids: submit returns one synchronously,
//! `wait`/`wait_all` rendezvous with the terminal result, `cancel` is
//! best-effort and idempotent.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::model::ModelRef;
use crate::scheduler::graph::{DependencyGraph, MarkOutcome, TerminalKind};
use crate::scheduler::pool::WorkerPool;
use crate::scheduler::queue::ReadyQueue;
use crate::scheduler::stats::{SchedulerStats, StatsSnapshot};
use crate::scheduler::task::{
    Priority, Task, TaskCallback, TaskId, TaskResult, TaskStatus,
};
use crate::tensor::Tensor;

/// How long `stop` waits for running tasks before force-failing them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Idle wake-up period of the driver thread; bounds reaping latency.
const DRIVER_TICK: Duration = Duration::from_millis(50);

/// Per-submission options.
#[derive(Default)]
pub struct TaskOptions {
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    /// Per-task deadline; falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Invoked once on the terminal transition, on the transitioning
    /// thread. Must not block and must not synchronously submit follow-up
    /// work on the same dependency chain.
    pub callback: Option<TaskCallback>,
}

impl TaskOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback: impl FnOnce(&TaskResult) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopping,
    Stopped,
}

enum DriverEvent {
    /// New work may be dispatchable.
    Wake,
    /// A task reached a terminal state; promote or cascade its dependents.
    Finished(TaskId),
    Stop,
}

struct Inner {
    config: SchedulerConfig,
    graph: DependencyGraph,
    queue: ReadyQueue,
    pool: RwLock<Option<Arc<WorkerPool>>>,
    lifecycle: Mutex<Lifecycle>,
    next_id: AtomicU64,
    stats: SchedulerStats,
    /// Closures handed to the pool and not yet finished; capped at
    /// `num_threads`.
    inflight: AtomicUsize,
    /// Tasks currently inside `infer`.
    running: AtomicUsize,
    events_tx: Sender<DriverEvent>,
    events_rx: Mutex<Option<Receiver<DriverEvent>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Priority and dependency aware inference scheduler.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a stopped scheduler. Call [`start`](Self::start) before
    /// submitting.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = unbounded();
        let queue = ReadyQueue::new(config.max_queue_size);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                graph: DependencyGraph::new(),
                queue,
                pool: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::Created),
                next_id: AtomicU64::new(1),
                stats: SchedulerStats::default(),
                inflight: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Bring up the worker pool and the driver thread. Idempotent while
    /// running; a stopped scheduler cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Created => {}
            Lifecycle::Stopping | Lifecycle::Stopped => {
                return Err(Error::InvalidArgument(
                    "scheduler cannot be restarted after stop".into(),
                ));
            }
        }

        let pool = Arc::new(WorkerPool::new(inner.config.num_threads));
        *inner.pool.write() = Some(pool);

        let events_rx = inner
            .events_rx
            .lock()
            .take()
            .expect("event receiver present before first start");
        let driver_inner = Arc::clone(inner);
        let handle = std::thread::Builder::new()
            .name("axon-driver".into())
            .spawn(move || driver_loop(&driver_inner, &events_rx))
            .expect("failed to spawn driver thread");
        *inner.driver.lock() = Some(handle);

        *lifecycle = Lifecycle::Running;
        info!(
            num_threads = inner.config.num_threads,
            max_queue_size = inner.config.max_queue_size,
            "scheduler started"
        );
        Ok(())
    }

    /// Cancel pending work, wait out running tasks, tear down the pool and
    /// the driver. Idempotent; terminates in bounded time for backends that
    /// return.
    pub fn stop(&self) {
        self.inner.stop();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.inner.lifecycle.lock() == Lifecycle::Running
    }

    /// Submit a dependency-free task.
    pub fn submit(
        &self,
        model: ModelRef,
        inputs: Vec<Tensor>,
        priority: Priority,
        callback: Option<TaskCallback>,
    ) -> Result<TaskId> {
        let mut options = TaskOptions::new().with_priority(priority);
        options.callback = callback;
        self.inner.submit_one(model, inputs, options)
    }

    /// Submit a task that may only start once every id in `dependencies`
    /// has completed.
    pub fn submit_with_dependencies(
        &self,
        model: ModelRef,
        inputs: Vec<Tensor>,
        dependencies: Vec<TaskId>,
        priority: Priority,
        callback: Option<TaskCallback>,
    ) -> Result<TaskId> {
        let mut options = TaskOptions::new()
            .with_priority(priority)
            .with_dependencies(dependencies);
        options.callback = callback;
        self.inner.submit_one(model, inputs, options)
    }

    /// Submit with full control over priority, dependencies, deadline and
    /// callback.
    pub fn submit_with_options(
        &self,
        model: ModelRef,
        inputs: Vec<Tensor>,
        options: TaskOptions,
    ) -> Result<TaskId> {
        self.inner.submit_one(model, inputs, options)
    }

    /// Atomically submit several independent tasks at one priority: either
    /// every pair is admitted or none is.
    pub fn submit_batch(
        &self,
        batch: Vec<(ModelRef, Vec<Tensor>)>,
        priority: Priority,
    ) -> Result<Vec<TaskId>> {
        self.inner.submit_batch(batch, priority)
    }

    /// Best-effort cancellation. Unscheduled tasks become `Cancelled`
    /// immediately and their dependents are cancelled with
    /// `DependencyFailed`; a running task only carries a soft flag that is
    /// honored before the backend is invoked. Idempotent, including for
    /// unknown or already-reaped ids.
    pub fn cancel(&self, id: TaskId) -> Result<()> {
        self.inner.cancel(id)
    }

    /// Block until the task reaches a terminal state or `timeout` elapses.
    /// A timed-out wait leaves the task untouched; for a known id, a zero
    /// timeout returns `Timeout` immediately regardless of task state.
    /// Unknown (or already-reaped) ids fail with `InvalidArgument`.
    pub fn wait(&self, id: TaskId, timeout: Option<Duration>) -> Result<TaskResult> {
        let task = self.inner.lookup(id)?;
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Timeout);
        }
        match task.wait_handle().wait(timeout) {
            Some(result) => {
                task.mark_observed();
                Ok(result)
            }
            None => Err(Error::Timeout),
        }
    }

    /// Wait on several tasks, sharing one deadline. The returned vector is
    /// aligned with `ids`; tasks that do not finish in time yield an entry
    /// carrying a `Timeout` error without failing the whole call.
    pub fn wait_all(
        &self,
        ids: &[TaskId],
        timeout: Option<Duration>,
    ) -> Result<Vec<TaskResult>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let tasks = ids
            .iter()
            .map(|&id| self.inner.lookup(id))
            .collect::<Result<Vec<_>>>()?;

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let outcome = match remaining {
                Some(rem) if rem.is_zero() => task.wait_handle().peek(),
                rem => task.wait_handle().wait(rem),
            };
            match outcome {
                Some(result) => {
                    task.mark_observed();
                    results.push(result);
                }
                None => results.push(TaskResult {
                    task_id: task.id(),
                    status: task.status(),
                    outputs: Vec::new(),
                    execution_time: Duration::ZERO,
                    error: Some(Error::Timeout),
                }),
            }
        }
        Ok(results)
    }

    /// Non-blocking status snapshot. `None` for ids the scheduler does not
    /// know, including reaped ones.
    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.graph.get(id).map(|task| task.status())
    }

    /// Tasks sitting in the ready queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner.queue.len()
    }

    /// Tasks currently executing inside a backend.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Completed tasks still retained in the graph.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.inner.graph.completed_count()
    }

    #[must_use]
    pub fn statistics(&self) -> StatsSnapshot {
        self.inner.stats.snapshot(self.inner.config.enable_profiling)
    }

    pub fn reset_statistics(&self) {
        self.inner.stats.reset();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if *self.lifecycle.lock() == Lifecycle::Running {
            Ok(())
        } else {
            Err(Error::SchedulerStopped)
        }
    }

    fn lookup(&self, id: TaskId) -> Result<Arc<Task>> {
        self.graph
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown task id {id}")))
    }

    fn submit_one(
        self: &Arc<Self>,
        model: ModelRef,
        inputs: Vec<Tensor>,
        options: TaskOptions,
    ) -> Result<TaskId> {
        self.ensure_running()?;
        if !model.validate_inputs(&inputs) {
            return Err(Error::InvalidArgument(
                "input tensors do not match model metadata".into(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dependencies: HashSet<TaskId> = options.dependencies.iter().copied().collect();
        let timeout = options.timeout.or(self.config.task_timeout);
        let task = Arc::new(Task::new(
            id,
            model,
            inputs,
            options.priority,
            dependencies,
            timeout,
            options.callback,
        ));

        let ready = self.graph.insert(Arc::clone(&task))?;
        if ready {
            if let Err(err) = self.queue.push(Arc::clone(&task)) {
                self.graph.discard(id);
                return Err(err);
            }
        }
        self.stats.record_submitted(1);
        let _ = self.events_tx.send(DriverEvent::Wake);
        debug!(task_id = id, priority = ?task.priority(), deps = task.dependencies().len(), "task submitted");
        Ok(id)
    }

    fn submit_batch(
        self: &Arc<Self>,
        batch: Vec<(ModelRef, Vec<Tensor>)>,
        priority: Priority,
    ) -> Result<Vec<TaskId>> {
        self.ensure_running()?;
        for (model, inputs) in &batch {
            if !model.validate_inputs(inputs) {
                return Err(Error::InvalidArgument(
                    "input tensors do not match model metadata".into(),
                ));
            }
        }

        let tasks: Vec<Arc<Task>> = batch
            .into_iter()
            .map(|(model, inputs)| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                Arc::new(Task::new(
                    id,
                    model,
                    inputs,
                    priority,
                    HashSet::new(),
                    self.config.task_timeout,
                    None,
                ))
            })
            .collect();

        for task in &tasks {
            // Dependency-free inserts cannot fail.
            self.graph.insert(Arc::clone(task))?;
        }
        if let Err(err) = self.queue.push_batch(&tasks) {
            for task in &tasks {
                self.graph.discard(task.id());
            }
            return Err(err);
        }
        self.stats.record_submitted(tasks.len() as u64);
        let _ = self.events_tx.send(DriverEvent::Wake);
        Ok(tasks.iter().map(|task| task.id()).collect())
    }

    fn cancel(self: &Arc<Self>, id: TaskId) -> Result<()> {
        let Some(task) = self.graph.get(id) else {
            return Ok(());
        };
        if task.status().is_terminal() {
            return Ok(());
        }
        task.request_cancel();
        if let Some(result) = task.try_cancel_now(Error::Cancelled) {
            self.stats.record_cancelled();
            task.invoke_callback(&result);
            debug!(task_id = id, "task cancelled");
            let _ = self.events_tx.send(DriverEvent::Finished(id));
        }
        Ok(())
    }

    fn stop(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running => *lifecycle = Lifecycle::Stopping,
                Lifecycle::Created => {
                    *lifecycle = Lifecycle::Stopped;
                    return;
                }
                Lifecycle::Stopping | Lifecycle::Stopped => return,
            }
        }
        info!("scheduler stopping");

        // Everything that has not been claimed by a worker is cancelled.
        for task in self.graph.tasks() {
            if let Some(result) = task.try_cancel_now(Error::SchedulerStopped) {
                self.stats.record_cancelled();
                task.invoke_callback(&result);
                self.apply_terminal(task.id(), TerminalKind::Cancelled);
            }
        }

        // Give running tasks a grace window to come back from the backend.
        let deadline = Instant::now() + STOP_GRACE;
        while self.running.load(Ordering::Acquire) > 0 || self.inflight.load(Ordering::Acquire) > 0
        {
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // Whatever is still running has overstayed the grace period.
        for task in self.graph.tasks() {
            if task.status() == TaskStatus::Running {
                if let Some(result) =
                    task.finish(TaskStatus::Failed, Vec::new(), Some(Error::Timeout))
                {
                    warn!(task_id = task.id(), "task failed to finish before shutdown");
                    self.stats.record_failed();
                    task.invoke_callback(&result);
                    self.apply_terminal(task.id(), TerminalKind::Failed);
                }
            }
        }

        self.queue.shutdown();
        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "drained ready queue on stop");
        }
        let _ = self.events_tx.send(DriverEvent::Stop);
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.pool.write().take() {
            pool.stop();
        }
        *self.lifecycle.lock() = Lifecycle::Stopped;
        info!("scheduler stopped");
    }

    /// Record a terminal transition in the graph and deal with the fallout:
    /// promote freed dependents to the queue, or cascade-cancel the
    /// downstream of a failure.
    fn apply_terminal(self: &Arc<Self>, id: TaskId, kind: TerminalKind) {
        match self.graph.mark_terminal(id, kind) {
            MarkOutcome::Promoted(ready) => {
                for task in ready {
                    self.promote(task);
                }
            }
            MarkOutcome::Cascade(victims) => {
                for task in victims {
                    task.request_cancel();
                    if let Some(result) = task.finish(
                        TaskStatus::Cancelled,
                        Vec::new(),
                        Some(Error::DependencyFailed(format!(
                            "upstream task {id} did not complete"
                        ))),
                    ) {
                        self.stats.record_cancelled();
                        task.invoke_callback(&result);
                        trace!(task_id = task.id(), upstream = id, "dependent cancelled");
                    }
                }
            }
        }
    }

    fn promote(self: &Arc<Self>, task: Arc<Task>) {
        match self.queue.push(Arc::clone(&task)) {
            Ok(()) => {}
            Err(Error::QueueFull) => {
                // The bound is a hard contract; a dependent that cannot be
                // queued fails rather than silently waiting unbounded.
                warn!(task_id = task.id(), "ready queue full, failing promoted task");
                if let Some(result) =
                    task.finish(TaskStatus::Failed, Vec::new(), Some(Error::QueueFull))
                {
                    self.stats.record_failed();
                    task.invoke_callback(&result);
                }
                self.apply_terminal(task.id(), TerminalKind::Failed);
            }
            Err(_) => {
                // Queue shut down mid-stop; the task is swept up with the
                // other unscheduled work.
                if let Some(result) = task.try_cancel_now(Error::SchedulerStopped) {
                    self.stats.record_cancelled();
                    task.invoke_callback(&result);
                }
                self.apply_terminal(task.id(), TerminalKind::Cancelled);
            }
        }
    }

    fn on_task_finished(self: &Arc<Self>, id: TaskId) {
        let Some(task) = self.graph.get(id) else {
            return;
        };
        let Some(kind) = TerminalKind::from_status(task.status()) else {
            return;
        };
        self.apply_terminal(id, kind);
    }

    /// Hand ready tasks to the pool, keeping at most `num_threads` closures
    /// outstanding.
    fn dispatch_ready(self: &Arc<Self>) {
        let pool_guard = self.pool.read();
        let Some(pool) = pool_guard.as_ref() else {
            return;
        };
        while self.inflight.load(Ordering::Acquire) < self.config.num_threads {
            let Some(task) = self.queue.pop(Some(Duration::ZERO)) else {
                break;
            };
            if task.status() != TaskStatus::Ready {
                // Cancelled while queued; nothing to run.
                continue;
            }
            self.inflight.fetch_add(1, Ordering::AcqRel);
            let runner = Arc::clone(self);
            let claimed = Arc::clone(&task);
            if pool
                .submit(Box::new(move || runner.run_task(&claimed)))
                .is_err()
            {
                self.inflight.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
    }

    /// Executes one task on a worker thread: soft-cancel check, the model
    /// call, deadline bookkeeping and result publication.
    fn run_task(self: &Arc<Self>, task: &Arc<Task>) {
        let id = task.id();
        if task.cancel_requested() {
            // Honored before the backend is touched.
            if let Some(result) = task.try_cancel_now(Error::Cancelled) {
                self.stats.record_cancelled();
                task.invoke_callback(&result);
            }
        } else if task.claim_running() {
            self.running.fetch_add(1, Ordering::AcqRel);
            if self.config.enable_profiling {
                if let Some(wait) = task.queue_wait() {
                    self.stats.record_queue_wait(wait);
                }
            }
            trace!(task_id = id, "task running");

            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| task.model().infer(task.inputs())));
            let elapsed = started.elapsed();

            let (status, outputs, error) = match outcome {
                Err(_) => (
                    TaskStatus::Failed,
                    Vec::new(),
                    Some(Error::BackendError(
                        "model panicked during inference".into(),
                    )),
                ),
                Ok(Err(err)) => (TaskStatus::Failed, Vec::new(), Some(err)),
                Ok(Ok(outputs)) => {
                    if task.cancel_requested() {
                        // Cancel arrived while the backend ran; the outputs
                        // are dropped.
                        (TaskStatus::Cancelled, Vec::new(), Some(Error::Cancelled))
                    } else if task.timeout().is_some_and(|limit| elapsed > limit) {
                        (TaskStatus::Failed, Vec::new(), Some(Error::Timeout))
                    } else {
                        (TaskStatus::Completed, outputs, None)
                    }
                }
            };

            if let Some(result) = task.finish(status, outputs, error) {
                match result.status {
                    TaskStatus::Completed => self.stats.record_completed(result.execution_time),
                    TaskStatus::Failed => {
                        debug!(task_id = id, error = ?result.error, "task failed");
                        self.stats.record_failed();
                    }
                    TaskStatus::Cancelled => self.stats.record_cancelled(),
                    _ => {}
                }
                task.invoke_callback(&result);
            }
            self.running.fetch_sub(1, Ordering::AcqRel);
        }
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let _ = self.events_tx.send(DriverEvent::Finished(id));
    }

    fn reap(&self) {
        let reaped = self.graph.reap(self.config.retention, Instant::now());
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped terminal tasks");
        }
    }
}

fn reap_interval(retention: Duration) -> Duration {
    (retention / 4).clamp(Duration::from_millis(50), Duration::from_secs(1))
}

fn driver_loop(inner: &Arc<Inner>, events: &Receiver<DriverEvent>) {
    debug!("scheduler driver started");
    let interval = reap_interval(inner.config.retention);
    let mut last_reap = Instant::now();
    loop {
        match events.recv_timeout(DRIVER_TICK) {
            Ok(DriverEvent::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(DriverEvent::Finished(id)) => inner.on_task_finished(id),
            Ok(DriverEvent::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }
        if last_reap.elapsed() >= interval {
            inner.reap();
            last_reap = Instant::now();
        }
        inner.dispatch_ready();
    }
    debug!("scheduler driver exited");
}

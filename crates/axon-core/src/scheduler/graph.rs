//! Dependency graph over task records.
//!
//! The graph tracks which tasks wait on which, detects tasks that become
//! runnable when a dependency completes, and propagates failure downstream.
//! All structural mutation happens under one writer lock; ready/cascade
//! deltas are computed under the lock and handed back so the caller can
//! publish them to the queue outside it.
//!
//! Lock order: the graph lock is always taken before any per-task state
//! lock, never the other way around.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::scheduler::task::{Task, TaskId, TaskStatus};

/// Which kind of terminal transition is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Completed,
    Failed,
    Cancelled,
}

impl TerminalKind {
    pub fn from_status(status: TaskStatus) -> Option<Self> {
        match status {
            TaskStatus::Completed => Some(TerminalKind::Completed),
            TaskStatus::Failed => Some(TerminalKind::Failed),
            TaskStatus::Cancelled => Some(TerminalKind::Cancelled),
            _ => None,
        }
    }
}

/// What a terminal transition unlocked.
pub enum MarkOutcome {
    /// Dependents whose last dependency just completed, ready to queue.
    Promoted(Vec<Arc<Task>>),
    /// Direct and transitive dependents of a failed/cancelled task; the
    /// caller cancels each with a dependency error.
    Cascade(Vec<Arc<Task>>),
}

#[derive(Default)]
struct GraphInner {
    tasks: HashMap<TaskId, Arc<Task>>,
    /// Forward edges: task id -> ids that depend on it.
    dependents: HashMap<TaskId, HashSet<TaskId>>,
    /// Reverse edges: task id -> dependency ids not yet completed.
    remaining: HashMap<TaskId, HashSet<TaskId>>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    cancelled: HashSet<TaskId>,
}

impl GraphInner {
    fn is_terminal(&self, id: TaskId) -> bool {
        self.completed.contains(&id) || self.failed.contains(&id) || self.cancelled.contains(&id)
    }

    fn detach(&mut self, id: TaskId) {
        self.tasks.remove(&id);
        self.dependents.remove(&id);
        if let Some(deps) = self.remaining.remove(&id) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(&id);
                }
            }
        }
        self.completed.remove(&id);
        self.failed.remove(&id);
        self.cancelled.remove(&id);
    }

    fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        self.tasks
            .keys()
            .any(|&id| self.has_cycle_dfs(id, &mut visited, &mut stack))
    }

    fn has_cycle_dfs(
        &self,
        node: TaskId,
        visited: &mut HashSet<TaskId>,
        stack: &mut HashSet<TaskId>,
    ) -> bool {
        if stack.contains(&node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        stack.insert(node);
        let found = self
            .dependents
            .get(&node)
            .is_some_and(|next| next.iter().any(|&n| self.has_cycle_dfs(n, visited, stack)));
        stack.remove(&node);
        found
    }
}

/// DAG of tasks with completion tracking.
#[derive(Default)]
pub struct DependencyGraph {
    inner: RwLock<GraphInner>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, wiring its dependency edges.
    ///
    /// Returns `true` if the task has no unfinished dependencies and can be
    /// queued immediately. Rejects unknown dependency ids, dependencies that
    /// already failed or were cancelled, and forward references (a
    /// dependency id must be older than the task's own id, which is what
    /// makes cycles structurally impossible).
    pub fn insert(&self, task: Arc<Task>) -> Result<bool> {
        let id = task.id();
        let mut inner = self.inner.write();

        if inner.tasks.contains_key(&id) {
            return Err(Error::InvalidArgument(format!("duplicate task id {id}")));
        }
        for &dep in task.dependencies() {
            if dep >= id {
                return Err(Error::InvalidArgument(format!(
                    "task {id} may only depend on earlier tasks, got {dep}"
                )));
            }
            if !inner.tasks.contains_key(&dep) {
                return Err(Error::InvalidArgument(format!(
                    "unknown dependency id {dep}"
                )));
            }
            if inner.failed.contains(&dep) || inner.cancelled.contains(&dep) {
                return Err(Error::InvalidArgument(format!(
                    "dependency {dep} already failed or was cancelled"
                )));
            }
        }

        let remaining: HashSet<TaskId> = task
            .dependencies()
            .iter()
            .copied()
            .filter(|dep| !inner.completed.contains(dep))
            .collect();
        for &dep in &remaining {
            inner.dependents.entry(dep).or_default().insert(id);
        }
        let ready = remaining.is_empty();
        inner.remaining.insert(id, remaining);
        inner.tasks.insert(id, task);

        debug_assert!(!inner.has_cycle(), "insertion created a cycle");
        Ok(ready)
    }

    /// Record a terminal transition and compute its downstream effect.
    ///
    /// For a completion, dependents whose remaining set drains are returned
    /// for promotion. For a failure or cancellation, every direct and
    /// transitive non-terminal dependent is returned for cascade
    /// cancellation (and marked cancelled in the graph's bookkeeping so
    /// later submissions see it).
    ///
    /// Recording the same id twice is a no-op returning an empty outcome.
    pub fn mark_terminal(&self, id: TaskId, kind: TerminalKind) -> MarkOutcome {
        let mut inner = self.inner.write();
        if inner.is_terminal(id) || !inner.tasks.contains_key(&id) {
            return MarkOutcome::Promoted(Vec::new());
        }

        match kind {
            TerminalKind::Completed => {
                inner.completed.insert(id);
                let dependents = inner.dependents.get(&id).cloned().unwrap_or_default();
                let mut promoted = Vec::new();
                for dep_id in dependents {
                    let drained = inner
                        .remaining
                        .get_mut(&dep_id)
                        .map(|set| {
                            set.remove(&id);
                            set.is_empty()
                        })
                        .unwrap_or(false);
                    if drained && !inner.is_terminal(dep_id) {
                        if let Some(task) = inner.tasks.get(&dep_id) {
                            promoted.push(Arc::clone(task));
                        }
                    }
                }
                trace!(task_id = id, promoted = promoted.len(), "task completed");
                MarkOutcome::Promoted(promoted)
            }
            TerminalKind::Failed | TerminalKind::Cancelled => {
                if kind == TerminalKind::Failed {
                    inner.failed.insert(id);
                } else {
                    inner.cancelled.insert(id);
                }
                // Breadth-first sweep over everything downstream.
                let mut cascade = Vec::new();
                let mut queue: VecDeque<TaskId> =
                    inner.dependents.get(&id).cloned().unwrap_or_default().into_iter().collect();
                while let Some(next) = queue.pop_front() {
                    if inner.is_terminal(next) {
                        continue;
                    }
                    inner.cancelled.insert(next);
                    if let Some(task) = inner.tasks.get(&next) {
                        cascade.push(Arc::clone(task));
                    }
                    if let Some(more) = inner.dependents.get(&next) {
                        queue.extend(more.iter().copied());
                    }
                }
                trace!(task_id = id, cascade = cascade.len(), "task failed or cancelled");
                MarkOutcome::Cascade(cascade)
            }
        }
    }

    /// Remove a terminal task. Only legal once all of its dependents are
    /// terminal as well; used by the reaper.
    pub fn remove(&self, id: TaskId) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.tasks.contains_key(&id) {
            return Err(Error::InvalidArgument(format!("unknown task id {id}")));
        }
        if !inner.is_terminal(id) {
            return Err(Error::InvalidArgument(format!(
                "task {id} is not terminal"
            )));
        }
        let blocked = inner
            .dependents
            .get(&id)
            .is_some_and(|deps| deps.iter().any(|&d| !inner.is_terminal(d)));
        if blocked {
            return Err(Error::InvalidArgument(format!(
                "task {id} still has non-terminal dependents"
            )));
        }
        inner.detach(id);
        Ok(())
    }

    /// Drop a task that failed admission before it became visible. No
    /// terminal checks; only the submit path uses this.
    pub(crate) fn discard(&self, id: TaskId) {
        self.inner.write().detach(id);
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.inner.read().tasks.get(&id).cloned()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.inner.read().tasks.contains_key(&id)
    }

    /// All task records currently in the graph.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.inner.read().tasks.values().cloned().collect()
    }

    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .tasks
            .keys()
            .filter(|id| !inner.is_terminal(**id))
            .count()
    }

    pub fn completed_count(&self) -> usize {
        self.inner.read().completed.len()
    }

    /// Defense-in-depth: dependencies only reference older ids, so this can
    /// never be true for graphs built through `insert`.
    pub fn has_cycle(&self) -> bool {
        self.inner.read().has_cycle()
    }

    /// Dependency-respecting order over all tasks (Kahn's algorithm).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let inner = self.inner.read();
        let mut indegree: HashMap<TaskId, usize> = inner
            .tasks
            .values()
            .map(|task| {
                let deps = task
                    .dependencies()
                    .iter()
                    .filter(|dep| inner.tasks.contains_key(dep))
                    .count();
                (task.id(), deps)
            })
            .collect();

        let mut ready: VecDeque<TaskId> = indegree
            .iter()
            .filter_map(|(&id, &deg)| (deg == 0).then_some(id))
            .collect();
        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            if let Some(dependents) = inner.dependents.get(&id) {
                for &dep_id in dependents {
                    if let Some(deg) = indegree.get_mut(&dep_id) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push_back(dep_id);
                        }
                    }
                }
            }
        }
        if order.len() != inner.tasks.len() {
            return Err(Error::InvalidArgument(
                "dependency graph contains a cycle".into(),
            ));
        }
        order.sort_by_key(|&id| (depth_of(&inner, id), id));
        Ok(order)
    }

    /// Remove terminal tasks whose result has been observed or whose
    /// retention window elapsed, provided no non-terminal dependent still
    /// references them. Returns the reaped ids.
    pub fn reap(&self, retention: Duration, now: Instant) -> Vec<TaskId> {
        let mut inner = self.inner.write();
        let candidates: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|task| {
                let id = task.id();
                if !inner.is_terminal(id) {
                    return false;
                }
                let blocked = inner
                    .dependents
                    .get(&id)
                    .is_some_and(|deps| deps.iter().any(|&d| !inner.is_terminal(d)));
                if blocked {
                    return false;
                }
                task.observed()
                    || task
                        .terminal_at()
                        .is_some_and(|at| now.duration_since(at) >= retention)
            })
            .map(|task| task.id())
            .collect();
        for &id in &candidates {
            inner.detach(id);
        }
        candidates
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = GraphInner::default();
    }
}

/// Longest dependency chain above `id`; makes the topological order stable
/// for assertions without changing its validity.
fn depth_of(inner: &GraphInner, id: TaskId) -> usize {
    fn go(inner: &GraphInner, id: TaskId, memo: &mut HashMap<TaskId, usize>) -> usize {
        if let Some(&d) = memo.get(&id) {
            return d;
        }
        let depth = inner
            .tasks
            .get(&id)
            .map(|task| {
                task.dependencies()
                    .iter()
                    .filter(|dep| inner.tasks.contains_key(dep))
                    .map(|&dep| go(inner, dep, memo) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(id, depth);
        depth
    }
    go(inner, id, &mut HashMap::new())
}

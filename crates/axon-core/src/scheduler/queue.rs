//! Bounded priority queue of runnable tasks.
//!
//! Ordering is `(priority desc, enqueue sequence asc)`: strict priority
//! first, first-come first-served within a priority so that sustained
//! high-priority load cannot reorder equals. The queue stamps each task
//! with its sequence number as it is admitted.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::scheduler::task::{Priority, Task};

struct ReadyEntry {
    priority: Priority,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then the lower sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<ReadyEntry>,
    shutdown: bool,
}

/// Priority-ordered multiset of ready tasks, bounded at `capacity`.
pub struct ReadyQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
    capacity: usize,
    next_seq: AtomicU64,
}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
            capacity,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Admit a task, marking it `Ready` and stamping its sequence number.
    ///
    /// # Errors
    ///
    /// `QueueFull` at capacity, `SchedulerStopped` after shutdown.
    pub fn push(&self, task: Arc<Task>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::SchedulerStopped);
        }
        if inner.heap.len() >= self.capacity {
            return Err(Error::QueueFull);
        }
        self.admit(&mut inner, task);
        drop(inner);
        self.cond.notify_one();
        Ok(())
    }

    /// Admit several tasks atomically: either the queue has room for all of
    /// them or none is admitted.
    pub fn push_batch(&self, tasks: &[Arc<Task>]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::SchedulerStopped);
        }
        if inner.heap.len() + tasks.len() > self.capacity {
            return Err(Error::QueueFull);
        }
        for task in tasks {
            self.admit(&mut inner, Arc::clone(task));
        }
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    fn admit(&self, inner: &mut QueueInner, task: Arc<Task>) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        task.mark_ready(seq);
        inner.heap.push(ReadyEntry {
            priority: task.priority(),
            seq,
            task,
        });
    }

    /// Block up to `timeout` (or indefinitely) for a task. Returns `None`
    /// on timeout or shutdown.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<Arc<Task>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if let Some(entry) = inner.heap.pop() {
                return Some(entry.task);
            }
            if inner.shutdown {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut inner, deadline).timed_out() {
                        return inner.heap.pop().map(|entry| entry.task);
                    }
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    /// Remove and return every queued task, best first.
    pub fn drain(&self) -> Vec<Arc<Task>> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            drained.push(entry.task);
        }
        drained
    }

    /// Wake all waiters and refuse further pushes.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

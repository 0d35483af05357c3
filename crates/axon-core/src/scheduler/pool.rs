//! Fixed-size worker pool.
//!
//! The pool runs parameterless units of work and knows nothing about tasks
//! or models; the scheduler wraps a task claim, the model call and result
//! publication into one closure per dispatch. Each worker blocks on a
//! channel pair and drains outstanding work before exiting on shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of worker threads draining a shared work channel.
pub struct WorkerPool {
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    shutdown_tx: Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Spawn `worker_count` workers. The count must be non-zero.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker pool needs at least one worker");
        let (job_tx, job_rx) = unbounded::<Job>();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(worker_count);
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count)
            .map(|idx| {
                let job_rx = job_rx.clone();
                let shutdown_rx = shutdown_rx.clone();
                let active = Arc::clone(&active);
                std::thread::Builder::new()
                    .name(format!("axon-worker-{idx}"))
                    .spawn(move || worker_loop(idx, &job_rx, &shutdown_rx, &active))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(worker_count, "worker pool started");
        Self {
            job_tx,
            job_rx,
            shutdown_tx,
            workers: Mutex::new(workers),
            active,
            stopped: AtomicBool::new(false),
        }
    }

    /// Enqueue a unit of work.
    ///
    /// # Errors
    ///
    /// `SchedulerStopped` once [`stop`](Self::stop) has been called.
    pub fn submit(&self, job: Job) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::SchedulerStopped);
        }
        self.job_tx
            .send(job)
            .map_err(|_| Error::SchedulerStopped)
    }

    /// Signal shutdown, wait for workers to drain outstanding work and exit.
    /// Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for _ in 0..handles.len() {
            let _ = self.shutdown_tx.send(());
        }
        for handle in handles {
            let _ = handle.join();
        }
        info!("worker pool stopped");
    }

    /// Workers currently executing a job. Best effort.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Jobs waiting in the work channel. Best effort.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.job_rx.len()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait until no work is queued or executing, up to `timeout`. Returns
    /// whether the pool went idle in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queued_count() == 0 && self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    idx: usize,
    job_rx: &Receiver<Job>,
    shutdown_rx: &Receiver<()>,
    active: &AtomicUsize,
) {
    debug!(worker = idx, "worker started");
    let mut processed = 0u64;
    loop {
        select! {
            recv(job_rx) -> msg => match msg {
                Ok(job) => {
                    active.fetch_add(1, Ordering::AcqRel);
                    job();
                    active.fetch_sub(1, Ordering::AcqRel);
                    processed += 1;
                }
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => {
                // Drain whatever is still queued, then exit.
                while let Ok(job) = job_rx.try_recv() {
                    active.fetch_add(1, Ordering::AcqRel);
                    job();
                    active.fetch_sub(1, Ordering::AcqRel);
                    processed += 1;
                }
                break;
            }
        }
    }
    debug!(worker = idx, processed, "worker exited");
}

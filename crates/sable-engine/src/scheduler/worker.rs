//! The blocking worker pool
//!
//! Workers execute pure native jobs that must never touch the heap, the
//! operand stack or any frame. Two queues connect the pool to the main
//! thread, each guarded by a mutex and signaled through a condition
//! variable: the task queue feeds jobs in, the result queue carries
//! [`AsyncTaskResult`]s back. The main loop drains results between ticks
//! and sleeps on the result condvar when idle.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::debug;

/// Plain-data result of a worker job
///
/// Workers cannot allocate heap values; the main thread converts the
/// output into a value when it dispatches the callback.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Err(String),
}

/// A blocking native job
pub type WorkerJob = Box<dyn FnOnce() -> WorkerOutput + Send + 'static>;

/// A job handed to the pool, identified by the uid of its pending callback
pub struct AsyncTask {
    pub uid: u64,
    pub job: WorkerJob,
}

/// A completed job posted back to the main thread
#[derive(Debug)]
pub struct AsyncTaskResult {
    pub uid: u64,
    pub output: WorkerOutput,
}

struct Shared {
    tasks: Mutex<VecDeque<AsyncTask>>,
    task_available: Condvar,
    results: Mutex<VecDeque<AsyncTaskResult>>,
    result_available: Condvar,
    shutdown: AtomicBool,
}

/// Pool of worker threads executing [`AsyncTask`]s
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` worker threads
    pub fn new(count: usize) -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(VecDeque::new()),
            task_available: Condvar::new(),
            results: Mutex::new(VecDeque::new()),
            result_available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("sable-worker-{id}"))
                .spawn(move || Self::run_loop(shared, id))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles }
    }

    fn run_loop(shared: Arc<Shared>, id: usize) {
        loop {
            let task = {
                let mut tasks = shared.tasks.lock();
                loop {
                    if shared.shutdown.load(Ordering::Acquire) {
                        debug!(target: "sable_scheduler", worker = id, "worker shutting down");
                        return;
                    }
                    if let Some(task) = tasks.pop_front() {
                        break task;
                    }
                    shared.task_available.wait(&mut tasks);
                }
            };

            // A panicking job must not take the worker down with it
            let uid = task.uid;
            let output = catch_unwind(AssertUnwindSafe(move || (task.job)()))
                .unwrap_or_else(|_| WorkerOutput::Err("worker job panicked".to_string()));

            shared
                .results
                .lock()
                .push_back(AsyncTaskResult { uid, output });
            shared.result_available.notify_one();
        }
    }

    /// Hand a job to the pool
    pub fn submit(&self, task: AsyncTask) {
        self.shared.tasks.lock().push_back(task);
        self.shared.task_available.notify_one();
    }

    /// Drain all posted results without blocking
    pub fn try_drain(&self) -> Vec<AsyncTaskResult> {
        self.shared.results.lock().drain(..).collect()
    }

    /// Block until a result is available, `deadline` passes, or the pool
    /// is woken spuriously; callers re-check their queues afterwards
    pub fn wait_for_result(&self, deadline: Option<Instant>) {
        let mut results = self.shared.results.lock();
        if !results.is_empty() {
            return;
        }
        match deadline {
            Some(deadline) => {
                self.shared
                    .result_available
                    .wait_until(&mut results, deadline);
            }
            None => {
                self.shared.result_available.wait(&mut results);
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.task_available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_executes_job() {
        let pool = WorkerPool::new(2);
        pool.submit(AsyncTask {
            uid: 1,
            job: Box::new(|| WorkerOutput::Int(42)),
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut results = Vec::new();
        while results.is_empty() && Instant::now() < deadline {
            pool.wait_for_result(Some(Instant::now() + Duration::from_millis(50)));
            results = pool.try_drain();
        }

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].uid, 1);
        assert_eq!(results[0].output, WorkerOutput::Int(42));
    }

    #[test]
    fn test_pool_runs_jobs_in_parallel_threads() {
        let pool = WorkerPool::new(4);
        for uid in 0..8 {
            pool.submit(AsyncTask {
                uid,
                job: Box::new(move || {
                    thread::sleep(Duration::from_millis(10));
                    WorkerOutput::Int(uid as i64)
                }),
            });
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < 8 && Instant::now() < deadline {
            pool.wait_for_result(Some(Instant::now() + Duration::from_millis(50)));
            results.extend(pool.try_drain());
        }
        assert_eq!(results.len(), 8);
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let pool = WorkerPool::new(1);
        pool.submit(AsyncTask {
            uid: 1,
            job: Box::new(|| panic!("boom")),
        });
        pool.submit(AsyncTask {
            uid: 2,
            job: Box::new(|| WorkerOutput::Int(2)),
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < 2 && Instant::now() < deadline {
            pool.wait_for_result(Some(Instant::now() + Duration::from_millis(50)));
            results.extend(pool.try_drain());
        }

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0].output, WorkerOutput::Err(_)));
        assert_eq!(results[1].output, WorkerOutput::Int(2));
    }

    #[test]
    fn test_pool_clean_shutdown() {
        let pool = WorkerPool::new(2);
        assert_eq!(pool.worker_count(), 2);
        drop(pool);
    }

    #[test]
    fn test_wait_for_result_times_out() {
        let pool = WorkerPool::new(1);
        let start = Instant::now();
        pool.wait_for_result(Some(Instant::now() + Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}

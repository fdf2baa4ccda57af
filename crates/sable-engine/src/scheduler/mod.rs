//! The runtime scheduler
//!
//! All user code runs on the thread driving the VM. Between tasks the
//! runtime drains worker results into the task queue, fires due timers
//! and intervals in deadline order, and sleeps on the worker result
//! condvar until the nearest deadline when nothing is runnable. The
//! runtime terminates with the recorded status code once no task, timer,
//! interval or in-flight worker job remains.

pub mod worker;

use crate::vm::machine::Vm;
use sable_core::Value;
use std::time::{Duration, Instant};
use tracing::debug;
use worker::{AsyncTask, WorkerJob, WorkerOutput};

/// Stable id returned by timer and interval registration
pub type TimerId = u64;

/// A `(function, argument)` pair scheduled to run on the main thread
#[derive(Debug, Clone, Copy)]
pub struct VmTask {
    pub function: Value,
    pub argument: Value,
}

impl VmTask {
    pub fn new(function: Value, argument: Value) -> Self {
        Self { function, argument }
    }
}

/// Ordering key for timers and intervals
///
/// Deadline order with ties broken by the monotonically increasing id,
/// which preserves insertion order for equal deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    pub deadline: Instant,
    pub id: TimerId,
}

impl Vm {
    /// Enqueue a callback to run on the main thread
    pub fn register_task(&mut self, function: Value, argument: Value) {
        self.task_queue.push_back(VmTask::new(function, argument));
    }

    /// Schedule a one-shot callback for `deadline`
    pub fn register_timer(&mut self, deadline: Instant, function: Value, argument: Value) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let key = TimerKey { deadline, id };
        self.timers.insert(key, VmTask::new(function, argument));
        self.timer_keys.insert(id, key);
        id
    }

    /// Schedule a recurring callback every `period`, first firing one
    /// period from now
    pub fn register_interval(
        &mut self,
        period: Duration,
        function: Value,
        argument: Value,
    ) -> TimerId {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let key = TimerKey {
            deadline: Instant::now() + period,
            id,
        };
        self.intervals.insert(key, (VmTask::new(function, argument), period));
        self.interval_keys.insert(id, key);
        id
    }

    /// Cancel a pending timer; unknown ids are ignored
    pub fn clear_timer(&mut self, id: TimerId) {
        if let Some(key) = self.timer_keys.remove(&id) {
            self.timers.remove(&key);
        }
    }

    /// Cancel a pending interval; unknown ids are ignored
    pub fn clear_interval(&mut self, id: TimerId) {
        if let Some(key) = self.interval_keys.remove(&id) {
            self.intervals.remove(&key);
        }
    }

    /// Hand a blocking job to the worker pool
    ///
    /// When the job completes, `callback` is enqueued as an ordinary task
    /// with the converted result as its argument.
    pub fn register_worker_task(&mut self, job: WorkerJob, callback: Value) -> u64 {
        let uid = self.next_job_id;
        self.next_job_id += 1;
        self.pending_jobs.insert(uid, callback);
        self.workers.submit(AsyncTask { uid, job });
        uid
    }

    /// Drop interest in a worker job; the job still runs to completion,
    /// but its result is discarded at drain time
    pub fn clear_worker_task(&mut self, uid: u64) {
        self.pending_jobs.remove(&uid);
    }

    /// Drive the scheduler until nothing is pending or `exit` was called
    pub fn start_runtime(&mut self) -> u8 {
        while self.running {
            self.drain_worker_results();
            self.fire_due_timers();

            if let Some(task) = self.task_queue.pop_front() {
                self.run_task(task);
                continue;
            }

            if !self.has_pending() {
                break;
            }

            let deadline = self.nearest_deadline();
            self.workers.wait_for_result(deadline);
        }
        debug!(target: "sable_scheduler", status = self.status_code, "runtime finished");
        self.status_code
    }

    /// Run a scheduled callback in a fresh top-level call; an uncaught
    /// throw aborts only this task
    pub(crate) fn run_task(&mut self, task: VmTask) {
        self.failed_task = false;
        let _ = self.exec_function(task.function, task.argument);
        self.failed_task = false;
    }

    /// Move completed worker results into the task queue
    pub(crate) fn drain_worker_results(&mut self) {
        for result in self.workers.try_drain() {
            let Some(callback) = self.pending_jobs.remove(&result.uid) else {
                // Cancelled after completion: drop the result
                continue;
            };

            // The callback left the pending map (a GC root); keep it
            // alive while the output is converted into a heap value
            self.heap.register_temporary(callback);
            let argument = self.worker_output_value(result.output);
            self.heap.unregister_temporary(callback);

            self.task_queue.push_back(VmTask::new(callback, argument));
        }
    }

    fn worker_output_value(&mut self, output: WorkerOutput) -> Value {
        match output {
            WorkerOutput::Null => Value::null(),
            WorkerOutput::Bool(b) => Value::boolean(b),
            WorkerOutput::Int(i) => self.create_integer(i),
            WorkerOutput::Float(f) => self.create_float(f),
            WorkerOutput::Str(s) => self.create_string(&s),
            WorkerOutput::Err(message) => self.create_string(&message),
        }
    }

    /// Fire every timer and interval whose deadline has passed, in
    /// nondecreasing deadline order with insertion order breaking ties
    pub(crate) fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let timer_key = self
                .timers
                .keys()
                .next()
                .copied()
                .filter(|key| key.deadline <= now);
            let interval_key = self
                .intervals
                .keys()
                .next()
                .copied()
                .filter(|key| key.deadline <= now);

            match (timer_key, interval_key) {
                (None, None) => break,
                (Some(key), None) => self.fire_timer(key),
                (None, Some(key)) => self.fire_interval(key),
                (Some(timer), Some(interval)) => {
                    if timer <= interval {
                        self.fire_timer(timer);
                    } else {
                        self.fire_interval(interval);
                    }
                }
            }
        }
    }

    fn fire_timer(&mut self, key: TimerKey) {
        let task = self.timers.remove(&key).expect("timer key out of sync");
        self.timer_keys.remove(&key.id);
        self.run_task(task);
    }

    fn fire_interval(&mut self, key: TimerKey) {
        let (task, period) = self
            .intervals
            .remove(&key)
            .expect("interval key out of sync");
        self.run_task(task);

        // Fixed-delay rescheduling; skipped if the callback cleared the
        // interval while it ran
        if self.interval_keys.contains_key(&key.id) {
            let next = TimerKey {
                deadline: Instant::now() + period,
                id: key.id,
            };
            self.intervals.insert(next, (task, period));
            self.interval_keys.insert(key.id, next);
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.timers.is_empty() || !self.intervals.is_empty() || !self.pending_jobs.is_empty()
    }

    fn nearest_deadline(&self) -> Option<Instant> {
        let timer = self.timers.keys().next().map(|key| key.deadline);
        let interval = self.intervals.keys().next().map(|key| key.deadline);
        match (timer, interval) {
            (Some(t), Some(i)) => Some(t.min(i)),
            (Some(t), None) => Some(t),
            (None, Some(i)) => Some(i),
            (None, None) => None,
        }
    }
}

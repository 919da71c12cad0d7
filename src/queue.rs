// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Queues: ordered/retaining channels that tasks are enqueued into instead
//! of started directly against a job.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::job::JobHandle;
use crate::pool::Handle;
use crate::task::TaskHandle;
use crate::types::{Affinity, Priority};

/// An ABA-safe reference to a [`Queue`] in a node's queue pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct QueueHandle(pub(crate) Handle);

/// Attributes a queue is created with.
#[derive(Clone, Copy, Debug)]
pub struct QueueAttributes {
    priority: Priority,
    ordered: bool,
    retain: bool,
    affinity: Option<Affinity>,
}

impl QueueAttributes {
    #[must_use]
    pub fn new() -> Self {
        Self {
            priority: Priority(0),
            ordered: false,
            retain: false,
            affinity: None,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// An ordered queue runs at most one of its tasks at a time, in enqueue
    /// order.
    #[must_use]
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// A retaining queue parks newly-enqueued tasks instead of cancelling
    /// them while disabled.
    #[must_use]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = Some(affinity);
        self
    }
}

impl Default for QueueAttributes {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the inflight count and ordering state for tasks enqueued through
/// it; the FIFOs of parked tasks and pending deque ordering.
pub struct Queue {
    job: JobHandle,
    priority: Priority,
    ordered: bool,
    retain: bool,
    affinity: Option<Affinity>,
    enabled: AtomicBool,
    num_tasks: AtomicI64,
    ordered_task_executing: AtomicBool,
    /// Tasks parked while `ordered_task_executing` was already held.
    ordered_tasks: Mutex<VecDeque<TaskHandle>>,
    /// Tasks parked while the queue was disabled (retaining queues only).
    retained_tasks: Mutex<VecDeque<TaskHandle>>,
}

impl Queue {
    pub(crate) fn new(job: JobHandle, attrs: QueueAttributes) -> Self {
        Self {
            job,
            priority: attrs.priority,
            ordered: attrs.ordered,
            retain: attrs.retain,
            affinity: attrs.affinity,
            enabled: AtomicBool::new(true),
            num_tasks: AtomicI64::new(0),
            ordered_task_executing: AtomicBool::new(false),
            ordered_tasks: Mutex::new(VecDeque::new()),
            retained_tasks: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn job(&self) -> JobHandle {
        self.job
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    #[must_use]
    pub fn is_retaining(&self) -> bool {
        self.retain
    }

    #[must_use]
    pub fn affinity(&self) -> Option<Affinity> {
        self.affinity
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn num_tasks(&self) -> i64 {
        self.num_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn begin_task(&self) {
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_task(&self) {
        self.num_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Attempts to claim the right to run a task from this ordered queue.
    /// Returns `true` if the caller may proceed to execute it now; `false`
    /// means the caller must park it in `ordered_tasks` instead.
    pub(crate) fn try_begin_ordered(&self) -> bool {
        self.ordered_task_executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the ordered-execution slot, letting the next park/steal
    /// claim it.
    pub(crate) fn end_ordered(&self) {
        self.ordered_task_executing.store(false, Ordering::Release);
    }

    pub(crate) fn park_ordered(&self, task: TaskHandle) {
        self.ordered_tasks.lock().unwrap().push_back(task);
    }

    pub(crate) fn pop_ordered_successor(&self) -> Option<TaskHandle> {
        self.ordered_tasks.lock().unwrap().pop_front()
    }

    pub(crate) fn park_retained(&self, task: TaskHandle) {
        self.retained_tasks.lock().unwrap().push_back(task);
    }

    /// Drains every retained task in enqueue order, for rescheduling on
    /// re-enable.
    pub(crate) fn drain_retained(&self) -> Vec<TaskHandle> {
        self.retained_tasks.lock().unwrap().drain(..).collect()
    }
}

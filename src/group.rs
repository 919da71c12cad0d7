// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Groups: collective wait over a set of tasks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::error::Status;
use crate::pool::Handle;
use crate::task::TaskHandle;
use crate::types::Timeout;

/// An ABA-safe reference to a [`Group`] in a node's group pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct GroupHandle(pub(crate) Handle);

/// Attributes a group is created with. Currently carries no tunables beyond
/// the node-wide `max_groups`/`max_tasks_per_group` limits enforced by the
/// pool itself; kept as a builder for symmetry with the other attribute
/// structs and so new tunables don't break callers.
#[derive(Clone, Copy, Debug, Default)]
pub struct GroupAttributes {
    _private: (),
}

impl GroupAttributes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// An inflight counter plus a completed-task FIFO, drained by
/// [`Self::wait_any`] / blocked on by [`Self::wait_all`].
pub struct Group {
    inflight: AtomicU32,
    completed: Mutex<VecDeque<(TaskHandle, Status)>>,
    cvar: Condvar,
}

impl Group {
    pub(crate) fn new() -> Self {
        Self {
            inflight: AtomicU32::new(0),
            completed: Mutex::new(VecDeque::new()),
            cvar: Condvar::new(),
        }
    }

    /// Registers a task as belonging to this group; call before the task is
    /// scheduled so `wait_all` cannot observe a false "nothing outstanding".
    pub(crate) fn add_task(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    /// Moves a finished task into the completed FIFO and wakes waiters.
    pub(crate) fn task_completed(&self, task: TaskHandle, status: Status) {
        self.completed.lock().unwrap().push_back((task, status));
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        self.cvar.notify_all();
    }

    #[must_use]
    pub fn num_inflight(&self) -> u32 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Drains every entry sitting in the completed FIFO. `wait_all` only
    /// waits on the inflight counter, so tasks it never individually
    /// returned to a caller are cleaned up this way once it succeeds.
    pub(crate) fn drain_completed(&self) -> Vec<(TaskHandle, Status)> {
        self.completed.lock().unwrap().drain(..).collect()
    }

    /// Blocks until at least one task has completed, returning it and its
    /// status, or `None` on timeout.
    pub(crate) fn wait_any(
        &self,
        timeout: Timeout,
        mut poll_once: impl FnMut() -> bool,
    ) -> Option<(TaskHandle, Status)> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut guard = self.completed.lock().unwrap();
        loop {
            if let Some(entry) = guard.pop_front() {
                return Some(entry);
            }
            if poll_once() {
                continue;
            }
            let wait_for = match deadline {
                None => std::time::Duration::from_millis(10),
                Some(dl) => match dl.checked_duration_since(Instant::now()) {
                    Some(remaining) => remaining.min(std::time::Duration::from_millis(10)),
                    None => return None,
                },
            };
            let (next, _) = self.cvar.wait_timeout(guard, wait_for).unwrap();
            guard = next;
        }
    }

    /// Blocks until every task ever added to this group has reached a
    /// terminal state. A task completed via [`Self::wait_any`] still counts;
    /// `wait_all` only inspects the inflight counter, not the FIFO.
    pub(crate) fn wait_all(&self, timeout: Timeout, mut poll_once: impl FnMut() -> bool) -> Status {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut guard = self.completed.lock().unwrap();
        loop {
            if self.inflight.load(Ordering::Acquire) == 0 {
                return Status::Success;
            }
            if poll_once() {
                continue;
            }
            let wait_for = match deadline {
                None => std::time::Duration::from_millis(10),
                Some(dl) => match dl.checked_duration_since(Instant::now()) {
                    Some(remaining) => remaining.min(std::time::Duration::from_millis(10)),
                    None => return Status::Timeout,
                },
            };
            let (next, _) = self.cvar.wait_timeout(guard, wait_for).unwrap();
            guard = next;
        }
    }
}

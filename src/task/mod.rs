// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task object and its lifecycle.
//!
//! A [`Task`] is one invocation of an action: it owns its argument bytes, a
//! result buffer, a link back to the job it was started against, and
//! (optionally) a group or queue it was enqueued through. `instances_todo`
//! counts down once per completed instance; the 1->0 transition is the only
//! one that materializes a terminal [`state::Lifecycle`] and fires the
//! completion hook, satisfying the "exactly once" requirement regardless of
//! how many instances run concurrently.

pub mod builder;
pub mod context;
pub mod state;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

pub use builder::TaskAttributes;
pub use context::TaskContext;
use context::CancelFlag;
use state::{Lifecycle, ScheduleAction, StartAction, State};

use crate::action::ActionHandle;
use crate::error::Status;
use crate::group::GroupHandle;
use crate::job::JobHandle;
use crate::pool::Handle;
use crate::queue::QueueHandle;
use crate::types::{Affinity, Priority, Timeout};

/// An ABA-safe reference to a [`Task`] in a node's task pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TaskHandle(pub(crate) Handle);

struct Completion {
    lock: Mutex<bool>,
    cvar: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            lock: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.lock.lock().unwrap() = true;
        self.cvar.notify_all();
    }

    /// Blocks until signalled or `timeout` elapses, returning `false` on
    /// timeout. `poll_once` is invoked between wait attempts so a waiting
    /// worker thread can make progress on its own run loop instead of
    /// blocking outright (depth-one cooperative re-entry).
    fn wait(&self, timeout: Timeout, mut poll_once: impl FnMut() -> bool) -> bool {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut done = self.lock.lock().unwrap();
        loop {
            if *done {
                return true;
            }
            if poll_once() {
                continue;
            }
            let wait_for = match deadline {
                None => std::time::Duration::from_millis(10),
                Some(dl) => match dl.checked_duration_since(Instant::now()) {
                    Some(remaining) => remaining.min(std::time::Duration::from_millis(10)),
                    None => return *done,
                },
            };
            let (guard, _) = self.cvar.wait_timeout(done, wait_for).unwrap();
            done = guard;
        }
    }
}

/// One invocation of an action.
pub struct Task {
    job: JobHandle,
    action: ActionHandle,
    args: Box<[u8]>,
    result: Mutex<Vec<u8>>,
    attrs: TaskAttributes,
    state: State,
    instances_todo: AtomicU32,
    current_instance: AtomicU32,
    error: Mutex<Option<Status>>,
    cancel_flag: CancelFlag,
    group: Option<GroupHandle>,
    queue: Option<QueueHandle>,
    completion: Completion,
    holds_ordered_lock: std::sync::atomic::AtomicBool,
}

impl Task {
    pub(crate) fn new(
        job: JobHandle,
        action: ActionHandle,
        args: Vec<u8>,
        attrs: TaskAttributes,
        group: Option<GroupHandle>,
        queue: Option<QueueHandle>,
    ) -> Self {
        let instances = attrs.instances();
        Self {
            job,
            action,
            args: args.into_boxed_slice(),
            result: Mutex::new(Vec::new()),
            attrs,
            state: State::new(),
            instances_todo: AtomicU32::new(instances),
            current_instance: AtomicU32::new(0),
            error: Mutex::new(None),
            cancel_flag: CancelFlag::new(),
            group,
            queue,
            completion: Completion::new(),
            holds_ordered_lock: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn job(&self) -> JobHandle {
        self.job
    }

    #[must_use]
    pub fn action(&self) -> ActionHandle {
        self.action
    }

    #[must_use]
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.attrs.is_detached()
    }

    #[must_use]
    pub fn num_instances(&self) -> u32 {
        self.attrs.instances()
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.attrs.task_priority()
    }

    #[must_use]
    pub fn affinity(&self) -> Option<Affinity> {
        self.attrs.task_affinity()
    }

    #[must_use]
    pub fn group(&self) -> Option<GroupHandle> {
        self.group
    }

    #[must_use]
    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.load().lifecycle()
    }

    #[must_use]
    pub fn error_code(&self) -> Option<Status> {
        *self.error.lock().unwrap()
    }

    pub(crate) fn mark_created(&self) {
        self.state.mark_created();
    }

    pub(crate) fn try_schedule(&self) -> ScheduleAction {
        self.state.try_schedule()
    }

    pub(crate) fn try_start_running(&self) -> StartAction {
        self.state.try_start_running()
    }

    /// Claims the next `instance_num` for this task, in `0..num_instances`.
    pub(crate) fn next_instance_num(&self) -> u32 {
        self.current_instance.fetch_add(1, Ordering::AcqRel)
    }

    /// Builds the per-instance context for `instance_num`.
    pub(crate) fn context_for(&self, core_num: u32, instance_num: u32) -> TaskContext {
        TaskContext::new(
            core_num,
            instance_num,
            self.attrs.instances(),
            self.attrs.task_priority(),
            self.cancel_flag.clone(),
        )
    }

    /// Records an instance's outcome and returns `true` once
    /// `instances_todo` has reached zero, i.e. the task is finished and
    /// ready for finalization.
    pub(crate) fn record_instance_result(&self, outcome: Result<Vec<u8>, Status>) -> bool {
        match outcome {
            Ok(bytes) => {
                *self.result.lock().unwrap() = bytes;
            }
            Err(status) => {
                self.error.lock().unwrap().get_or_insert(status);
            }
        }
        self.instances_todo.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Finalizes the terminal lifecycle from the recorded error code (or
    /// `Completed` if none was ever recorded), publishes it, and wakes any
    /// waiter.
    pub(crate) fn finalize(&self) -> Lifecycle {
        let outcome = match *self.error.lock().unwrap() {
            None => Lifecycle::Completed,
            Some(Status::ErrActionCancelled) => Lifecycle::Cancelled,
            Some(_) => Lifecycle::Error,
        };
        self.state.finish(outcome);
        self.completion.signal();
        outcome
    }

    /// Requests cancellation; see [`state::State::request_cancel`]. Only
    /// flips the state word and the cooperative flag — it never touches
    /// `error` or signals `completion` itself, since the task may already be
    /// sitting in a worker's FIFO with its one-time finalize bookkeeping
    /// (action/queue/group counters, ordered-lock release) still pending.
    /// That bookkeeping always runs through [`Self::finalize`], reached via
    /// the normal `try_schedule`/`try_start_running` path the next time the
    /// task is dequeued or admitted, which is why every live task is
    /// guaranteed exactly one pending finalize regardless of when
    /// cancellation lands.
    pub(crate) fn request_cancel(&self) -> Lifecycle {
        self.cancel_flag.set();
        self.state.request_cancel()
    }

    /// Records the cancelled error code for a task about to be finalized
    /// via the `StartAction::Cancelled` path, i.e. one that never ran.
    pub(crate) fn mark_cancelled(&self) {
        self.error.lock().unwrap().get_or_insert(Status::ErrActionCancelled);
    }

    /// Blocks the calling thread until this task reaches a terminal state,
    /// or `timeout` elapses. `poll_once` lets a worker thread drain its own
    /// run loop while waiting instead of blocking the OS thread outright.
    /// Relies solely on `completion`'s signal, never on the state word's own
    /// lifecycle: `request_cancel` can flip the lifecycle to `Cancelled`
    /// before `finalize` has recorded the error or run its bookkeeping, so
    /// checking `self.lifecycle().is_terminal()` here would let a caller
    /// observe "done" before it actually is.
    pub(crate) fn wait(&self, timeout: Timeout, poll_once: impl FnMut() -> bool) -> Status {
        if self.completion.wait(timeout, poll_once) {
            self.error.lock().unwrap().unwrap_or(Status::Success)
        } else {
            Status::Timeout
        }
    }

    #[must_use]
    pub fn result(&self) -> Vec<u8> {
        self.result.lock().unwrap().clone()
    }

    /// Parks this not-yet-started task when its queue is disabled and
    /// retaining.
    pub(crate) fn park_retained(&self) {
        self.state.park_retained();
    }

    /// Releases this task from a retaining queue's park list back to
    /// `Scheduled`, ready to be pushed onto a worker queue again.
    pub(crate) fn release_from_retain(&self) {
        self.state.release_from_retain();
    }

    /// Records whether this task instance is the one that claimed its
    /// queue's `ordered_task_executing` lock, so finalization only releases
    /// the lock (and promotes a successor) when it was actually the holder.
    pub(crate) fn set_holds_ordered_lock(&self, held: bool) {
        self.holds_ordered_lock.store(held, Ordering::Release);
    }

    #[must_use]
    pub(crate) fn holds_ordered_lock(&self) -> bool {
        self.holds_ordered_lock.load(Ordering::Acquire)
    }
}

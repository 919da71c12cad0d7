// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Actions: the executable descriptor a task is started against.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::error::Status;
use crate::pool::Handle;
use crate::task::TaskContext;
use crate::types::{Affinity, JobId, Timeout};

/// An ABA-safe reference to an [`Action`] in a node's action pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ActionHandle(pub(crate) Handle);

/// The user-supplied body of an action: reads `args`, writes `result`, and
/// may poll `ctx` for cancellation. Returning `Err` marks the instance
/// `ErrActionFailed` (or whatever status is returned) without aborting the
/// task's other instances.
pub type ExecFn = dyn Fn(&[u8], &mut Vec<u8>, &TaskContext) -> Result<(), Status> + Send + Sync;

/// Callbacks for a plug-in action that dispatches work to an external
/// executor instead of running `exec_fn` on the worker thread.
pub struct PluginCallbacks {
    /// Invoked on the worker in place of `exec_fn`. The plug-in owns
    /// asynchronous completion: a `Success` return means the plug-in will
    /// later call the node's task-complete hook itself.
    pub start: Box<dyn Fn(crate::task::TaskHandle) -> Status + Send + Sync>,
    /// Best-effort cancellation request, forwarded to the external executor.
    pub cancel: Box<dyn Fn(crate::task::TaskHandle) + Send + Sync>,
    /// Called once at action deletion, after `num_tasks` has reached zero.
    pub finalize: Box<dyn Fn() + Send + Sync>,
}

/// Attributes an action is created with.
#[derive(Clone, Copy, Debug)]
pub struct ActionAttributes {
    affinity: Affinity,
}

impl ActionAttributes {
    #[must_use]
    pub fn new(num_workers: u32) -> Self {
        Self {
            affinity: Affinity::all(num_workers),
        }
    }

    #[must_use]
    pub fn affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }
}

enum Body {
    Native(Box<ExecFn>),
    Plugin(PluginCallbacks),
}

/// An executable descriptor that tasks are started or enqueued against.
pub struct Action {
    job_id: JobId,
    affinity: Affinity,
    body: Body,
    num_tasks: AtomicI64,
    enabled: AtomicBool,
    idle: Condvar,
    idle_lock: Mutex<()>,
}

impl Action {
    pub(crate) fn native(job_id: JobId, attrs: ActionAttributes, exec_fn: Box<ExecFn>) -> Self {
        Self {
            job_id,
            affinity: attrs.affinity,
            body: Body::Native(exec_fn),
            num_tasks: AtomicI64::new(0),
            enabled: AtomicBool::new(true),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
        }
    }

    pub(crate) fn plugin(job_id: JobId, attrs: ActionAttributes, callbacks: PluginCallbacks) -> Self {
        Self {
            job_id,
            affinity: attrs.affinity,
            body: Body::Plugin(callbacks),
            num_tasks: AtomicI64::new(0),
            enabled: AtomicBool::new(true),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    #[must_use]
    pub fn is_plugin(&self) -> bool {
        matches!(self.body, Body::Plugin(_))
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

    /// Called when a task is started against this action.
    pub(crate) fn begin_task(&self) {
        self.num_tasks.fetch_add(1, Ordering::AcqRel);
    }

    /// Called once a task's all instances have finalized.
    pub(crate) fn end_task(&self) {
        if self.num_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock().unwrap();
            self.idle.notify_all();
        }
    }

    /// Calls the native `exec_fn`, or dispatches to the plug-in's
    /// `start` callback and reports whether the scheduler should treat the
    /// instance as finished immediately (native, or a plug-in start that
    /// failed) or deferred (a plug-in start that returned `Success`).
    pub(crate) fn invoke(
        &self,
        args: &[u8],
        result: &mut Vec<u8>,
        ctx: &TaskContext,
        task: crate::task::TaskHandle,
    ) -> InvokeOutcome {
        match &self.body {
            Body::Native(f) => InvokeOutcome::Finished(f(args, result, ctx)),
            Body::Plugin(cb) => match (cb.start)(task) {
                Status::Success => InvokeOutcome::Deferred,
                err => InvokeOutcome::Finished(Err(err)),
            },
        }
    }

    pub(crate) fn request_plugin_cancel(&self, task: crate::task::TaskHandle) {
        if let Body::Plugin(cb) = &self.body {
            (cb.cancel)(task);
        }
    }

    /// Blocks until `num_tasks` reaches zero or `timeout` elapses.
    pub(crate) fn wait_idle(&self, timeout: Timeout) -> Status {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut guard = self.idle_lock.lock().unwrap();
        loop {
            if self.num_tasks.load(Ordering::Acquire) == 0 {
                return Status::Success;
            }
            let wait_for = match deadline {
                None => std::time::Duration::from_millis(50),
                Some(dl) => match dl.checked_duration_since(Instant::now()) {
                    Some(remaining) => remaining,
                    None => return Status::Timeout,
                },
            };
            let (next_guard, timed_out) = self.idle.wait_timeout(guard, wait_for).unwrap();
            guard = next_guard;
            if timed_out.timed_out() && deadline.is_some() {
                if self.num_tasks.load(Ordering::Acquire) == 0 {
                    return Status::Success;
                }
                return Status::Timeout;
            }
        }
    }

    /// Runs the plug-in's `finalize` callback; called by `Node` once
    /// `num_tasks == 0` at action deletion, a no-op for native actions.
    pub(crate) fn finalize_plugin(&self) {
        if let Body::Plugin(cb) = &self.body {
            (cb.finalize)();
        }
    }
}

pub(crate) enum InvokeOutcome {
    Finished(Result<(), Status>),
    Deferred,
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The context handed to an action's `exec_fn` while it runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::Priority;

/// Shared, per-task cancellation flag. One lives per task and is cloned into
/// every [`TaskContext`] built for that task's instances.
#[derive(Clone)]
pub(crate) struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-instance execution context passed by reference to an action's
/// `exec_fn`.
///
/// The original C API represents this as an opaque pointer that a caller
/// could retain past the call or pass in from the wrong thread, which is why
/// its status enum carries `ErrContextInvalid`/`ErrContextOutOfContext`. Here
/// `&TaskContext` is an ordinary borrow scoped to the `exec_fn` call: the
/// borrow checker rejects retaining it past that call at compile time, so
/// there is nothing for either status code to report at run time.
pub struct TaskContext {
    core_num: u32,
    instance_num: u32,
    num_instances: u32,
    priority: Priority,
    cancel_flag: CancelFlag,
}

impl TaskContext {
    pub(crate) fn new(
        core_num: u32,
        instance_num: u32,
        num_instances: u32,
        priority: Priority,
        cancel_flag: CancelFlag,
    ) -> Self {
        Self {
            core_num,
            instance_num,
            num_instances,
            priority,
            cancel_flag,
        }
    }

    /// The worker index this instance is running on.
    #[must_use]
    pub fn core_num(&self) -> u32 {
        self.core_num
    }

    /// This instance's index within `0..num_instances`.
    #[must_use]
    pub fn instance_num(&self) -> u32 {
        self.instance_num
    }

    /// The total number of instances the owning task was started with.
    #[must_use]
    pub fn num_instances(&self) -> u32 {
        self.num_instances
    }

    /// The priority the task was scheduled at.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Polls whether cancellation has been requested for this task.
    ///
    /// Long-running actions should check this periodically and return early
    /// when it becomes `true`; the scheduler never preempts an action, so
    /// cancellation of a running task is purely cooperative.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.get()
    }
}

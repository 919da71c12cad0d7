// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The status taxonomy returned at every public API boundary.

use core::fmt;

/// Result alias used throughout the crate's public API.
pub type Result<T> = core::result::Result<T, Status>;

/// Every outcome a call into this crate's public API can produce.
///
/// `Status` is deliberately a flat, closed enum rather than a nested error
/// type: every public function returns exactly one of these variants, and
/// nothing here is retried automatically by the runtime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Status {
    /// The call completed successfully.
    Success,
    /// A wait or join timed out before the awaited condition became true.
    Timeout,
    /// An error occurred that does not fit any other variant.
    ErrUnknown,
    /// An argument failed validation.
    ErrParameter,
    /// The node has not been initialized (call [`crate::node::node_init`] first).
    ErrNodeNotInit,
    /// The node has already been initialized; call `node_finalize` first.
    ErrNodeInitialized,
    /// The job handle does not refer to a live job.
    ErrJobInvalid,
    /// The action handle does not refer to a live action.
    ErrActionInvalid,
    /// The action has been deleted and can no longer be used.
    ErrActionDeleted,
    /// The action pool is exhausted.
    ErrActionLimit,
    /// The action's `exec_fn` reported an error for this task.
    ErrActionFailed,
    /// The task was cancelled before or during its action.
    ErrActionCancelled,
    /// The task handle does not refer to a live task.
    ErrTaskInvalid,
    /// The task pool is exhausted.
    ErrTaskLimit,
    /// The queue handle does not refer to a live queue.
    ErrQueueInvalid,
    /// The queue pool is exhausted.
    ErrQueueLimit,
    /// The queue is disabled and not retaining; the task was rejected.
    ErrQueueDisabled,
    /// The queue has been deleted.
    ErrQueueDeleted,
    /// The group handle does not refer to a live group.
    ErrGroupInvalid,
    /// The group pool is exhausted.
    ErrGroupLimit,
    /// A `TaskContext` was used from a thread that does not own it.
    ErrContextInvalid,
    /// A `TaskContext` was used outside of the action call that produced it.
    ErrContextOutOfContext,
    /// An attribute key/value pair failed validation.
    ErrAttrNum,
    /// The hazard-pointer module has no free accessor slot for this thread.
    ErrTooManyAccessors,
}

impl Status {
    /// Returns `true` for [`Status::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    /// Converts `Success` into `Ok(())`, everything else into `Err(self)`.
    pub const fn into_result(self) -> Result<()> {
        match self {
            Status::Success => Ok(()),
            other => Err(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::Success => "success",
            Status::Timeout => "operation timed out",
            Status::ErrUnknown => "unknown error",
            Status::ErrParameter => "invalid parameter",
            Status::ErrNodeNotInit => "node not initialized",
            Status::ErrNodeInitialized => "node already initialized",
            Status::ErrJobInvalid => "invalid job handle",
            Status::ErrActionInvalid => "invalid action handle",
            Status::ErrActionDeleted => "action has been deleted",
            Status::ErrActionLimit => "action pool exhausted",
            Status::ErrActionFailed => "action reported an error",
            Status::ErrActionCancelled => "action was cancelled",
            Status::ErrTaskInvalid => "invalid task handle",
            Status::ErrTaskLimit => "task pool exhausted",
            Status::ErrQueueInvalid => "invalid queue handle",
            Status::ErrQueueLimit => "queue pool exhausted",
            Status::ErrQueueDisabled => "queue is disabled",
            Status::ErrQueueDeleted => "queue has been deleted",
            Status::ErrGroupInvalid => "invalid group handle",
            Status::ErrGroupLimit => "group pool exhausted",
            Status::ErrContextInvalid => "task context used from the wrong thread",
            Status::ErrContextOutOfContext => "task context used outside of its action call",
            Status::ErrAttrNum => "invalid attribute value",
            Status::ErrTooManyAccessors => "too many concurrent accessors",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Status {}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task lifecycle state machine.
//!
//! A task moves through `Prenatal -> Created -> Scheduled -> Running ->
//! {Completed|Error|Cancelled|Retained}`. The whole lifecycle plus a
//! "cancel requested" flag is packed into one `AtomicU32` so transitions can
//! be expressed as a single compare-and-swap loop, following the shape of
//! `async-rt`'s `State::transition`, rather than as several independently
//! racy fields.
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// The lifecycle position of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Allocated in the pool but not yet handed to `task_start`.
    Prenatal = 0,
    /// Validated and waiting to be handed to a worker.
    Created = 1,
    /// Pushed onto a worker's queue, not yet picked up.
    Scheduled = 2,
    /// Currently executing on some worker (or one of its instances is).
    Running = 3,
    /// Ran to completion with no error.
    Completed = 4,
    /// The action reported an error, or ran out of retries.
    Error = 5,
    /// Cancelled before or during execution.
    Cancelled = 6,
    /// Finished but held in a retaining queue for reuse instead of freed.
    Retained = 7,
}

impl Lifecycle {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Lifecycle::Prenatal,
            1 => Lifecycle::Created,
            2 => Lifecycle::Scheduled,
            3 => Lifecycle::Running,
            4 => Lifecycle::Completed,
            5 => Lifecycle::Error,
            6 => Lifecycle::Cancelled,
            _ => Lifecycle::Retained,
        }
    }

    /// `true` once a task has left the scheduler for good (barring reuse
    /// via a retaining queue, which moves it back through `Created`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Lifecycle::Completed | Lifecycle::Error | Lifecycle::Cancelled
        )
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Prenatal => "prenatal",
            Lifecycle::Created => "created",
            Lifecycle::Scheduled => "scheduled",
            Lifecycle::Running => "running",
            Lifecycle::Completed => "completed",
            Lifecycle::Error => "error",
            Lifecycle::Cancelled => "cancelled",
            Lifecycle::Retained => "retained",
        };
        f.write_str(s)
    }
}

const LIFECYCLE_BITS: u32 = 0b111;
const CANCEL_REQUESTED: u32 = 1 << 3;

static_assertions::const_assert!(Lifecycle::Retained as u32 <= LIFECYCLE_BITS);
static_assertions::const_assert_eq!(CANCEL_REQUESTED & LIFECYCLE_BITS, 0);

/// A snapshot of [`State`], decoded from one atomic load.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Snapshot(u32);

impl Snapshot {
    #[must_use]
    pub const fn lifecycle(self) -> Lifecycle {
        Lifecycle::from_bits(self.0 & LIFECYCLE_BITS)
    }

    #[must_use]
    pub const fn cancel_requested(self) -> bool {
        self.0 & CANCEL_REQUESTED != 0
    }

    const fn with_lifecycle(self, lc: Lifecycle) -> Self {
        Self((self.0 & !LIFECYCLE_BITS) | (lc as u32))
    }

    const fn with_cancel_requested(self) -> Self {
        Self(self.0 | CANCEL_REQUESTED)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("lifecycle", &self.lifecycle())
            .field("cancel_requested", &self.cancel_requested())
            .finish()
    }
}

/// The atomic lifecycle word of a task.
pub struct State {
    val: AtomicU32,
}

/// Outcome of [`State::try_schedule`].
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub enum ScheduleAction {
    /// The task moved from `Created` to `Scheduled`; push it to a worker.
    Scheduled,
    /// The task was cancelled before it could be scheduled.
    Cancelled,
}

/// Outcome of [`State::try_start_running`].
#[must_use]
#[derive(Debug, Eq, PartialEq)]
pub enum StartAction {
    /// The task moved from `Scheduled` to `Running`; call the action.
    Run,
    /// A cancellation raced the scheduler; skip the action.
    Cancelled,
}

impl State {
    #[must_use]
    pub fn new() -> Self {
        Self {
            val: AtomicU32::new(Lifecycle::Prenatal as u32),
        }
    }

    #[must_use]
    pub fn load(&self) -> Snapshot {
        Snapshot(self.val.load(Ordering::Acquire))
    }

    fn transition<T>(&self, mut f: impl FnMut(Snapshot) -> (Snapshot, T)) -> T {
        let mut current = Snapshot(self.val.load(Ordering::Acquire));
        loop {
            let (next, result) = f(current);
            if current.0 == next.0 {
                return result;
            }
            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return result,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }

    /// `Prenatal -> Created`. Only called once, right after pool insertion.
    pub fn mark_created(&self) {
        self.transition(|s| (s.with_lifecycle(Lifecycle::Created), ()));
    }

    /// `Created -> Scheduled`, unless a cancellation already landed.
    pub fn try_schedule(&self) -> ScheduleAction {
        self.transition(|s| {
            if s.cancel_requested() {
                (s.with_lifecycle(Lifecycle::Cancelled), ScheduleAction::Cancelled)
            } else {
                (s.with_lifecycle(Lifecycle::Scheduled), ScheduleAction::Scheduled)
            }
        })
    }

    /// `Scheduled -> Running`, unless a cancellation already landed.
    pub fn try_start_running(&self) -> StartAction {
        self.transition(|s| {
            if s.cancel_requested() {
                (s.with_lifecycle(Lifecycle::Cancelled), StartAction::Cancelled)
            } else {
                (s.with_lifecycle(Lifecycle::Running), StartAction::Run)
            }
        })
    }

    /// Requests cancellation. Takes effect immediately if the task has not
    /// started running yet; otherwise it is left for the action to observe
    /// cooperatively via [`Snapshot::cancel_requested`].
    ///
    /// Returns the lifecycle the task ended up in.
    pub fn request_cancel(&self) -> Lifecycle {
        self.transition(|s| {
            let lc = s.lifecycle();
            if lc.is_terminal() || lc == Lifecycle::Retained {
                (s, lc)
            } else if lc == Lifecycle::Running {
                (s.with_cancel_requested(), Lifecycle::Running)
            } else {
                let next = s.with_cancel_requested().with_lifecycle(Lifecycle::Cancelled);
                (next, Lifecycle::Cancelled)
            }
        })
    }

    /// Moves a running task to one of the terminal states.
    pub fn finish(&self, outcome: Lifecycle) {
        debug_assert!(outcome.is_terminal());
        self.transition(|s| (s.with_lifecycle(outcome), ()));
    }

    /// Parks a not-yet-started task that belongs to a retaining queue that
    /// was just disabled.
    pub fn park_retained(&self) {
        self.transition(|s| (s.with_lifecycle(Lifecycle::Retained), ()));
    }

    /// Releases a task parked by [`Self::park_retained`] back to
    /// `Scheduled`, for re-admission to a worker queue on queue re-enable.
    pub fn release_from_retain(&self) {
        self.transition(|s| (s.with_lifecycle(Lifecycle::Scheduled), ()));
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let s = State::new();
        assert_eq!(s.load().lifecycle(), Lifecycle::Prenatal);
        s.mark_created();
        assert_eq!(s.load().lifecycle(), Lifecycle::Created);
        assert_eq!(s.try_schedule(), ScheduleAction::Scheduled);
        assert_eq!(s.try_start_running(), StartAction::Run);
        assert_eq!(s.load().lifecycle(), Lifecycle::Running);
        s.finish(Lifecycle::Completed);
        assert_eq!(s.load().lifecycle(), Lifecycle::Completed);
    }

    #[test]
    fn cancel_before_schedule_short_circuits() {
        let s = State::new();
        s.mark_created();
        s.request_cancel();
        assert_eq!(s.try_schedule(), ScheduleAction::Cancelled);
        assert_eq!(s.load().lifecycle(), Lifecycle::Cancelled);
    }

    #[test]
    fn cancel_during_run_only_sets_flag() {
        let s = State::new();
        s.mark_created();
        s.try_schedule();
        s.try_start_running();
        let lc = s.request_cancel();
        assert_eq!(lc, Lifecycle::Running, "action must observe and finish itself");
        assert!(s.load().cancel_requested());
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Jobs: a named group of actions sharing a `(domain, job_id)` key.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::action::ActionHandle;
use crate::pool::Handle;
use crate::types::{DomainId, JobId, Priority};

/// An ABA-safe reference to a [`Job`] in a node's job pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct JobHandle(pub(crate) Handle);

/// A named collection of one or more actions. Starting a task against a job
/// picks whichever member action currently has the fewest inflight tasks,
/// load-balancing across actions that implement the same job id on
/// different executors (e.g. CPU vs. plug-in).
pub struct Job {
    domain: DomainId,
    job_id: JobId,
    actions: Mutex<Vec<ActionHandle>>,
    /// Per-`(job, priority)` round-robin counters for affinity-pinned task
    /// placement, keyed by priority level so unrelated jobs never perturb
    /// each other's rotation.
    affinity_cursors: Vec<AtomicU32>,
}

impl Job {
    pub(crate) fn new(domain: DomainId, job_id: JobId, max_priorities: u8) -> Self {
        Self {
            domain,
            job_id,
            actions: Mutex::new(Vec::new()),
            affinity_cursors: (0..max_priorities).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[must_use]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub(crate) fn add_action(&self, action: ActionHandle) {
        self.actions.lock().unwrap().push(action);
    }

    pub(crate) fn remove_action(&self, action: ActionHandle) {
        self.actions.lock().unwrap().retain(|a| *a != action);
    }

    #[must_use]
    pub fn actions(&self) -> Vec<ActionHandle> {
        self.actions.lock().unwrap().clone()
    }

    /// Picks the member action with the smallest `num_tasks`, as read by
    /// `num_tasks_of`. A plain scan is acceptable: this is a heuristic, not
    /// a linearizable decision.
    pub(crate) fn pick_action(
        &self,
        num_tasks_of: impl Fn(ActionHandle) -> Option<i64>,
    ) -> Option<ActionHandle> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter_map(|a| num_tasks_of(a).map(|n| (a, n)))
            .min_by_key(|(_, n)| *n)
            .map(|(a, _)| a)
    }

    /// Advances and returns this job's round-robin affinity cursor for
    /// `priority`, used to rotate affinity-pinned tasks across the bits set
    /// in their effective affinity mask.
    pub(crate) fn next_affinity_cursor(&self, priority: Priority) -> u32 {
        let idx = priority.0 as usize;
        self.affinity_cursors[idx].fetch_add(1, Ordering::Relaxed)
    }
}

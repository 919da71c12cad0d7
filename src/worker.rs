// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker scheduling state: public/private FIFOs, the sleep condition,
//! and the `pick_next_task` discipline. The actual run loop (which needs
//! the node's action/task/queue pools to execute a task) lives in
//! [`crate::node`]; this module only owns what a single worker owns.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::fifo::Fifo;
use crate::pool::Handle;
use crate::task::TaskHandle;

/// How `pick_next_task` orders its search across priority levels and
/// private/public/steal sources. Configured once at `Node::init`.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SchedulingMode {
    /// For each priority from highest to lowest: own private, own public,
    /// then steal from every other worker, before moving to the next
    /// priority.
    VeryHighPriorityFirst,
    /// Drain all of this worker's own private FIFOs, then all of its own
    /// public FIFOs, before stealing from anyone else.
    LocalityFirst,
}

/// The number of spin iterations a worker makes, yielding each time, before
/// falling back to a timed sleep.
pub const SPIN_BUDGET: u32 = 1024;

/// The sleep/retry granularity used both for a parked worker and for
/// `SPIN_BUDGET`-exhausted backoff, chosen so a push racing the sleep
/// decision is noticed promptly.
pub const SLEEP_QUANTUM: Duration = Duration::from_millis(10);

thread_local! {
    static CURRENT_WORKER: Cell<Option<u32>> = const { Cell::new(None) };
}

/// The index of the worker running on the calling thread, or `None` if the
/// calling thread is not a worker.
#[must_use]
pub fn current_worker() -> Option<u32> {
    CURRENT_WORKER.with(Cell::get)
}

pub(crate) fn set_current_worker(index: u32) {
    CURRENT_WORKER.with(|c| c.set(Some(index)));
}

/// One worker's queues and parking state, shared between its own OS thread
/// and any thread that pushes or steals work from it.
pub struct WorkerShared {
    index: u32,
    core: u32,
    public: Vec<Fifo>,
    private: Vec<Fifo>,
    sleeping: AtomicBool,
    park_lock: Mutex<()>,
    park_cvar: Condvar,
}

impl WorkerShared {
    /// `queue_capacity` bounds each per-priority FIFO; callers size it to
    /// the node's task pool capacity, since that already bounds how many
    /// tasks can be in flight across the whole node at once.
    #[must_use]
    pub fn new(index: u32, core: u32, max_priorities: u8, queue_capacity: usize) -> Self {
        Self {
            index,
            core,
            public: (0..max_priorities).map(|_| Fifo::new(queue_capacity)).collect(),
            private: (0..max_priorities).map(|_| Fifo::new(queue_capacity)).collect(),
            sleeping: AtomicBool::new(false),
            park_lock: Mutex::new(()),
            park_cvar: Condvar::new(),
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[must_use]
    pub fn core(&self) -> u32 {
        self.core
    }

    /// Pushes to the back of this worker's public FIFO at `priority`; any
    /// worker, including thieves, may later steal it from the back.
    pub fn push_public_back(&self, priority: u8, task: Handle) {
        self.public[priority as usize].push_back(task);
        self.wake();
    }

    /// Pushes to the back of this worker's private FIFO at `priority`; only
    /// this worker will ever dequeue it, pinning the task here.
    pub fn push_private_back(&self, priority: u8, task: Handle) {
        self.private[priority as usize].push_back(task);
        self.wake();
    }

    /// Pushes an ordered-queue successor to the very front of this worker's
    /// own private queue, giving it immediate priority over anything else
    /// waiting there.
    pub fn push_private_front(&self, priority: u8, task: Handle) {
        self.private[priority as usize].push_front(task);
        self.wake();
    }

    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// Wakes this worker if it is currently parked. Exposed beyond the
    /// push methods so node teardown can wake a sleeping worker without
    /// pushing it a task.
    pub(crate) fn wake(&self) {
        if self.sleeping.load(Ordering::Acquire) {
            let _guard = self.park_lock.lock().unwrap();
            self.park_cvar.notify_one();
            tracing::debug!(worker.index = self.index, "worker woken");
        }
    }

    /// Parks this worker for up to [`SLEEP_QUANTUM`], waking early if any
    /// push calls [`Self::wake`] while we hold the sleeping flag.
    pub fn park(&self) {
        self.sleeping.store(true, Ordering::Release);
        tracing::debug!(worker.index = self.index, "worker parking");
        let guard = self.park_lock.lock().unwrap();
        let _ = self.park_cvar.wait_timeout(guard, SLEEP_QUANTUM).unwrap();
        self.sleeping.store(false, Ordering::Release);
    }
}

fn try_own(worker: &WorkerShared, priority: u8) -> Option<Handle> {
    worker.private[priority as usize]
        .pop_front()
        .or_else(|| worker.public[priority as usize].pop_front())
}

fn try_steal_at(workers: &[WorkerShared], self_index: usize, priority: u8) -> Option<Handle> {
    let n = workers.len();
    let others = n.saturating_sub(1);
    // Randomize which worker is visited first so that under sustained
    // imbalance every worker doesn't converge on stealing from the same
    // victim in lockstep; still visits every other worker exactly once.
    let shift = fastrand::usize(0..others.max(1));
    for i in 0..others {
        let offset = 1 + (i + shift) % others;
        let victim = (self_index + offset) % n;
        if let Some(h) = workers[victim].public[priority as usize].steal() {
            tracing::debug!(
                worker.index = self_index,
                victim.index = victim,
                priority,
                "stole task from another worker"
            );
            return Some(h);
        }
    }
    None
}

/// Finds the next task handle this worker should execute, or `None` if
/// every FIFO reachable from here (own and stealable) is currently empty.
#[must_use]
pub fn pick_next_task(
    workers: &[WorkerShared],
    self_index: usize,
    mode: SchedulingMode,
) -> Option<TaskHandle> {
    let this = &workers[self_index];
    let max_priorities = this.private.len() as u8;

    let found = match mode {
        SchedulingMode::VeryHighPriorityFirst => (0..max_priorities).find_map(|p| {
            try_own(this, p).or_else(|| try_steal_at(workers, self_index, p))
        }),
        SchedulingMode::LocalityFirst => (0..max_priorities)
            .find_map(|p| this.private[p as usize].pop_front())
            .or_else(|| (0..max_priorities).find_map(|p| this.public[p as usize].pop_front()))
            .or_else(|| (0..max_priorities).find_map(|p| try_steal_at(workers, self_index, p))),
    };

    found.map(TaskHandle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::pool::ObjectPool;

    #[test]
    fn prefers_own_private_over_public_over_steal() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(8, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let workers = vec![WorkerShared::new(0, 0, 2, 8), WorkerShared::new(1, 1, 2, 8)];

        let h_public = pool.insert(1).unwrap();
        let h_private = pool.insert(2).unwrap();
        workers[0].push_public_back(0, h_public);
        workers[0].push_private_back(0, h_private);

        let picked = pick_next_task(&workers, 0, SchedulingMode::VeryHighPriorityFirst).unwrap();
        assert_eq!(picked.0, h_private);
    }

    #[test]
    fn steals_from_other_workers_public_fifo() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(8, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let workers = vec![WorkerShared::new(0, 0, 1, 8), WorkerShared::new(1, 1, 1, 8)];
        let h = pool.insert(1).unwrap();
        workers[1].push_public_back(0, h);

        let picked = pick_next_task(&workers, 0, SchedulingMode::VeryHighPriorityFirst).unwrap();
        assert_eq!(picked.0, h);
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The node: process-wide runtime singleton tying every other module
//! together.
//!
//! [`node_init`] allocates the object pools, spawns one worker thread per
//! bit set in `core_affinity`, and publishes the singleton. The returned
//! [`Node`] is a cheap `Arc` handle; every scheduling operation (starting a
//! task, enqueueing against a queue, waiting on a group, ...) is a method on
//! it. [`node_finalize`] stops and joins every worker and drops the pools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::action::{Action, ActionAttributes, ActionHandle, ExecFn, InvokeOutcome, PluginCallbacks};
use crate::error::Status;
use crate::group::{Group, GroupAttributes, GroupHandle};
use crate::job::{Job, JobHandle};
use crate::pool::ObjectPool;
use crate::queue::{Queue, QueueAttributes, QueueHandle};
use crate::task::state::{Lifecycle, ScheduleAction, StartAction};
use crate::task::{Task, TaskAttributes, TaskHandle};
use crate::types::{Affinity, DomainId, JobId, NodeId, Priority, Timeout};
use crate::worker::{self, SchedulingMode, WorkerShared};

static NODE: Mutex<Option<Arc<NodeInner>>> = Mutex::new(None);

/// Attributes a node is initialized with.
#[derive(Clone, Debug)]
pub struct NodeAttributes {
    max_actions: u32,
    max_actions_per_job: u32,
    max_jobs: u32,
    max_groups: u32,
    max_queues: u32,
    max_tasks: u32,
    max_priorities: u8,
    /// Upper bound on a single queue's pending task count; `0` means
    /// unbounded. Not part of the original attribute set's meaning for any
    /// other component, but reuses the queue's own limit-status code.
    queue_limit: u32,
    core_affinity: Affinity,
    worker_priorities: Vec<i32>,
    scheduling_mode: SchedulingMode,
}

impl NodeAttributes {
    /// Starts a builder for a node with `num_workers` worker threads, one
    /// per bit `0..num_workers` of the default `core_affinity`.
    #[must_use]
    pub fn new(num_workers: u32) -> Self {
        Self {
            max_actions: 256,
            max_actions_per_job: 16,
            max_jobs: 256,
            max_groups: 256,
            max_queues: 256,
            max_tasks: 4096,
            max_priorities: 1,
            queue_limit: 0,
            core_affinity: Affinity::all(num_workers),
            worker_priorities: vec![0; num_workers as usize],
            scheduling_mode: SchedulingMode::VeryHighPriorityFirst,
        }
    }

    #[must_use]
    pub fn max_actions(mut self, n: u32) -> Self {
        self.max_actions = n;
        self
    }

    #[must_use]
    pub fn max_actions_per_job(mut self, n: u32) -> Self {
        self.max_actions_per_job = n;
        self
    }

    #[must_use]
    pub fn max_jobs(mut self, n: u32) -> Self {
        self.max_jobs = n;
        self
    }

    #[must_use]
    pub fn max_groups(mut self, n: u32) -> Self {
        self.max_groups = n;
        self
    }

    #[must_use]
    pub fn max_queues(mut self, n: u32) -> Self {
        self.max_queues = n;
        self
    }

    #[must_use]
    pub fn max_tasks(mut self, n: u32) -> Self {
        self.max_tasks = n;
        self
    }

    #[must_use]
    pub fn max_priorities(mut self, n: u8) -> Self {
        self.max_priorities = n;
        self
    }

    #[must_use]
    pub fn queue_limit(mut self, n: u32) -> Self {
        self.queue_limit = n;
        self
    }

    /// Overrides which workers exist. The number of set bits becomes the
    /// node's worker count; worker indices are assigned densely in
    /// ascending bit order, independent of the bit positions themselves.
    #[must_use]
    pub fn core_affinity(mut self, affinity: Affinity) -> Self {
        self.core_affinity = affinity;
        self
    }

    /// OS scheduling priority per worker, in worker-index order. Recorded
    /// on each [`WorkerShared`] but not applied to the OS thread: this
    /// runtime has no portable way to set thread priority, so the value is
    /// carried for introspection and future platform-specific wiring only.
    #[must_use]
    pub fn worker_priorities(mut self, priorities: Vec<i32>) -> Self {
        self.worker_priorities = priorities;
        self
    }

    #[must_use]
    pub fn scheduling_mode(mut self, mode: SchedulingMode) -> Self {
        self.scheduling_mode = mode;
        self
    }

    fn build(self) -> Result<Self, Status> {
        if self.max_priorities == 0 {
            return Err(Status::ErrAttrNum);
        }
        if self.core_affinity.bits().count_ones() == 0 {
            return Err(Status::ErrAttrNum);
        }
        if !self.worker_priorities.is_empty()
            && u32::try_from(self.worker_priorities.len()).unwrap_or(u32::MAX)
                != self.core_affinity.bits().count_ones()
        {
            return Err(Status::ErrAttrNum);
        }
        Ok(self)
    }
}

/// A snapshot of a node's configured capacities and current live counts,
/// returned by [`Node::info`].
#[derive(Clone, Copy, Debug)]
pub struct Info {
    pub domain: DomainId,
    pub node: NodeId,
    pub num_workers: u32,
    pub max_actions: u32,
    pub actions_live: u32,
    pub max_jobs: u32,
    pub jobs_live: u32,
    pub max_tasks: u32,
    pub tasks_live: u32,
    pub max_queues: u32,
    pub queues_live: u32,
    pub max_groups: u32,
    pub groups_live: u32,
}

/// Which task attribute [`Node::task_get_attribute`] reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskAttributeKey {
    IsDetached,
    NumInstances,
    Priority,
    Affinity,
    ErrorCode,
}

/// The value returned by [`Node::task_get_attribute`].
#[derive(Clone, Copy, Debug)]
pub enum TaskAttributeValue {
    IsDetached(bool),
    NumInstances(u32),
    Priority(Priority),
    Affinity(Affinity),
    ErrorCode(Option<Status>),
}

struct NodeInner {
    domain: DomainId,
    node_id: NodeId,
    max_priorities: u8,
    max_actions_per_job: u32,
    queue_limit: u32,
    scheduling_mode: SchedulingMode,
    actions: ObjectPool<Action>,
    jobs: ObjectPool<Job>,
    tasks: ObjectPool<Task>,
    queues: ObjectPool<Queue>,
    groups: ObjectPool<Group>,
    job_index: Mutex<HashMap<(DomainId, JobId), JobHandle>>,
    workers: Vec<WorkerShared>,
    stop_requested: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A handle to the running node. Cheap to clone; every clone refers to the
/// same runtime.
#[derive(Clone)]
pub struct Node(Arc<NodeInner>);

impl std::ops::Deref for Node {
    type Target = NodeInner;

    fn deref(&self) -> &NodeInner {
        &self.0
    }
}

/// Initializes the process-wide node singleton and starts its workers.
///
/// Fails with [`Status::ErrNodeInitialized`] if a node is already running.
pub fn node_init(domain: DomainId, node_id: NodeId, attrs: NodeAttributes) -> Result<Node, Status> {
    let attrs = attrs.build()?;
    let mut guard = NODE.lock().unwrap();
    if guard.is_some() {
        return Err(Status::ErrNodeInitialized);
    }

    let cores: Vec<u32> = attrs.core_affinity.iter().collect();
    let num_workers = u32::try_from(cores.len()).expect("worker count fits in u32");

    let workers: Vec<WorkerShared> = cores
        .iter()
        .enumerate()
        .map(|(i, &core)| {
            let index = u32::try_from(i).expect("worker count fits in u32");
            WorkerShared::new(index, core, attrs.max_priorities, attrs.max_tasks as usize)
        })
        .collect();

    let inner = Arc::new(NodeInner {
        domain,
        node_id,
        max_priorities: attrs.max_priorities,
        max_actions_per_job: attrs.max_actions_per_job,
        queue_limit: attrs.queue_limit,
        scheduling_mode: attrs.scheduling_mode,
        actions: ObjectPool::new(
            attrs.max_actions as usize,
            Status::ErrActionInvalid,
            Status::ErrActionLimit,
        ),
        jobs: ObjectPool::new(attrs.max_jobs as usize, Status::ErrJobInvalid, Status::ErrJobInvalid),
        tasks: ObjectPool::new(attrs.max_tasks as usize, Status::ErrTaskInvalid, Status::ErrTaskLimit),
        queues: ObjectPool::new(
            attrs.max_queues as usize,
            Status::ErrQueueInvalid,
            Status::ErrQueueLimit,
        ),
        groups: ObjectPool::new(
            attrs.max_groups as usize,
            Status::ErrGroupInvalid,
            Status::ErrGroupLimit,
        ),
        job_index: Mutex::new(HashMap::new()),
        workers,
        stop_requested: AtomicBool::new(false),
        worker_handles: Mutex::new(Vec::new()),
    });

    let mut handles = Vec::with_capacity(num_workers as usize);
    for index in 0..num_workers {
        let inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("task-rt-worker-{index}"))
            .spawn(move || worker_main(&inner, index))
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }
    *inner.worker_handles.lock().unwrap() = handles;

    tracing::info!(domain = domain.0, node = node_id.0, num_workers, "node initialized");
    *guard = Some(Arc::clone(&inner));
    Ok(Node(inner))
}

/// Stops every worker, joins its thread, and tears down the node singleton.
///
/// Fails with [`Status::ErrNodeNotInit`] if no node is running.
pub fn node_finalize() -> Status {
    let inner = { NODE.lock().unwrap().take() };
    let Some(inner) = inner else {
        return Status::ErrNodeNotInit;
    };

    inner.stop_requested.store(true, Ordering::Release);
    for w in &inner.workers {
        w.wake();
    }
    let handles = std::mem::take(&mut *inner.worker_handles.lock().unwrap());
    for handle in handles {
        let _ = handle.join();
    }

    tracing::info!(domain = inner.domain.0, node = inner.node_id.0, "node finalized");
    Status::Success
}

/// Returns the currently running node, or `None` if none is initialized.
#[must_use]
pub fn node_get() -> Option<Node> {
    NODE.lock().unwrap().clone().map(Node)
}

fn worker_main(inner: &Arc<NodeInner>, index: u32) {
    worker::set_current_worker(index);
    tracing::info!(worker = index, "worker thread started");
    let mut backoff = 0u32;
    loop {
        if inner.stop_requested.load(Ordering::Acquire) {
            break;
        }
        match worker::pick_next_task(&inner.workers, index as usize, inner.scheduling_mode) {
            Some(handle) => {
                inner.execute_task(handle);
                backoff = 0;
            }
            None if backoff < worker::SPIN_BUDGET => {
                std::thread::yield_now();
                backoff += 1;
            }
            None => inner.workers[index as usize].park(),
        }
    }
    tracing::info!(worker = index, "worker thread stopped");
}

impl NodeInner {
    #[must_use]
    pub fn num_workers(&self) -> u32 {
        u32::try_from(self.workers.len()).expect("worker count fits in u32")
    }

    #[must_use]
    pub fn max_priorities(&self) -> u8 {
        self.max_priorities
    }

    #[must_use]
    pub fn info(&self) -> Info {
        Info {
            domain: self.domain,
            node: self.node_id,
            num_workers: self.num_workers(),
            max_actions: u32::try_from(self.actions.capacity()).unwrap_or(u32::MAX),
            actions_live: u32::try_from(self.actions.len()).unwrap_or(u32::MAX),
            max_jobs: u32::try_from(self.jobs.capacity()).unwrap_or(u32::MAX),
            jobs_live: u32::try_from(self.jobs.len()).unwrap_or(u32::MAX),
            max_tasks: u32::try_from(self.tasks.capacity()).unwrap_or(u32::MAX),
            tasks_live: u32::try_from(self.tasks.len()).unwrap_or(u32::MAX),
            max_queues: u32::try_from(self.queues.capacity()).unwrap_or(u32::MAX),
            queues_live: u32::try_from(self.queues.len()).unwrap_or(u32::MAX),
            max_groups: u32::try_from(self.groups.capacity()).unwrap_or(u32::MAX),
            groups_live: u32::try_from(self.groups.len()).unwrap_or(u32::MAX),
        }
    }

    /// Finds or creates the job keyed by `(domain, job_id)`.
    pub fn job_get(&self, domain: DomainId, job_id: JobId) -> Result<JobHandle, Status> {
        let mut index = self.job_index.lock().unwrap();
        if let Some(&h) = index.get(&(domain, job_id)) {
            if self.jobs.contains(h.0) {
                return Ok(h);
            }
        }
        let job = Job::new(domain, job_id, self.max_priorities);
        let raw = self.jobs.insert(job)?;
        let handle = JobHandle(raw);
        index.insert((domain, job_id), handle);
        Ok(handle)
    }

    pub fn action_create(
        &self,
        job_id: JobId,
        exec_fn: Box<ExecFn>,
        attrs: ActionAttributes,
    ) -> Result<ActionHandle, Status> {
        let job_handle = self.job_get(self.domain, job_id)?;
        self.check_action_budget(job_handle)?;
        let action = Action::native(job_id, attrs, exec_fn);
        let raw = self.actions.insert(action)?;
        let handle = ActionHandle(raw);
        if let Ok(job) = self.jobs.get(job_handle.0) {
            job.add_action(handle);
        }
        tracing::debug!(job_id = job_id.0, "native action created");
        Ok(handle)
    }

    pub fn plugin_action_create(
        &self,
        job_id: JobId,
        callbacks: PluginCallbacks,
        attrs: ActionAttributes,
    ) -> Result<ActionHandle, Status> {
        let job_handle = self.job_get(self.domain, job_id)?;
        self.check_action_budget(job_handle)?;
        let action = Action::plugin(job_id, attrs, callbacks);
        let raw = self.actions.insert(action)?;
        let handle = ActionHandle(raw);
        if let Ok(job) = self.jobs.get(job_handle.0) {
            job.add_action(handle);
        }
        tracing::debug!(job_id = job_id.0, "plugin action created");
        Ok(handle)
    }

    fn check_action_budget(&self, job_handle: JobHandle) -> Result<(), Status> {
        let job = self.jobs.get(job_handle.0)?;
        if u32::try_from(job.actions().len()).unwrap_or(u32::MAX) >= self.max_actions_per_job {
            return Err(Status::ErrActionLimit);
        }
        Ok(())
    }

    pub fn action_delete(&self, handle: ActionHandle, timeout: Timeout) -> Status {
        let action = match self.actions.get(handle.0) {
            Ok(a) => a,
            Err(e) => return e,
        };
        action.set_enabled(false);
        let status = action.wait_idle(timeout);
        if status != Status::Success {
            return status;
        }
        if let Ok(job_handle) = self.job_get(self.domain, action.job_id()) {
            if let Ok(job) = self.jobs.get(job_handle.0) {
                job.remove_action(handle);
            }
        }
        action.finalize_plugin();
        let _ = self.actions.remove(handle.0);
        Status::Success
    }

    pub fn action_enable(&self, handle: ActionHandle) -> Status {
        match self.actions.get(handle.0) {
            Ok(a) => {
                a.set_enabled(true);
                Status::Success
            }
            Err(e) => e,
        }
    }

    pub fn action_disable(&self, handle: ActionHandle, timeout: Timeout) -> Status {
        match self.actions.get(handle.0) {
            Ok(a) => {
                a.set_enabled(false);
                a.wait_idle(timeout)
            }
            Err(e) => e,
        }
    }

    fn pick_action_for(&self, job: &Job) -> Result<ActionHandle, Status> {
        job.pick_action(|a| {
            self.actions
                .get(a.0)
                .ok()
                .filter(|action| action.is_enabled())
                .map(|action| action.num_tasks())
        })
        .ok_or(Status::ErrActionInvalid)
    }

    fn admit_task(
        &self,
        job: JobHandle,
        action: ActionHandle,
        args: Vec<u8>,
        attrs: TaskAttributes,
        group: Option<GroupHandle>,
        queue: Option<QueueHandle>,
    ) -> Result<TaskHandle, Status> {
        let task = Task::new(job, action, args, attrs, group, queue);
        let raw = self.tasks.insert(task)?;
        let handle = TaskHandle(raw);
        let task = self.tasks.get(raw)?;
        task.mark_created();
        if let Ok(a) = self.actions.get(action.0) {
            a.begin_task();
        }
        if let Some(qh) = queue {
            if let Ok(q) = self.queues.get(qh.0) {
                q.begin_task();
            }
        }
        if let Some(gh) = group {
            if let Ok(g) = self.groups.get(gh.0) {
                g.add_task();
            }
        }
        tracing::trace!(task.id = raw.id(), "task created");
        Ok(handle)
    }

    /// Starts a task directly against a job, picking whichever member
    /// action currently has the fewest inflight tasks.
    pub fn task_start(
        &self,
        job: JobHandle,
        args: Vec<u8>,
        attrs: TaskAttributes,
        group: Option<GroupHandle>,
    ) -> Result<TaskHandle, Status> {
        let job_ref = self.jobs.get(job.0)?;
        let action = self.pick_action_for(&job_ref)?;
        let attrs = attrs.build(self.max_priorities)?;
        let handle = self.admit_task(job, action, args, attrs, group, None)?;
        self.schedule(handle);
        Ok(handle)
    }

    /// Enqueues a task against `queue` instead of starting it directly; the
    /// task's priority is taken from the queue's.
    pub fn task_enqueue(
        &self,
        queue_handle: QueueHandle,
        args: Vec<u8>,
        attrs: TaskAttributes,
        group: Option<GroupHandle>,
    ) -> Result<TaskHandle, Status> {
        let queue = self.queues.get(queue_handle.0)?;
        if !queue.is_enabled() && !queue.is_retaining() {
            return Err(Status::ErrQueueDisabled);
        }
        if self.queue_limit != 0 && queue.num_tasks() >= i64::from(self.queue_limit) {
            return Err(Status::ErrQueueLimit);
        }
        let job_ref = self.jobs.get(queue.job().0).map_err(|_| Status::ErrJobInvalid)?;
        let action = self.pick_action_for(&job_ref)?;
        let attrs = attrs.priority(queue.priority()).build(self.max_priorities)?;
        let handle = self.admit_task(queue.job(), action, args, attrs, group, Some(queue_handle))?;

        if !queue.is_enabled() {
            let task = self.tasks.get(handle.0)?;
            task.park_retained();
            queue.park_retained(handle);
        } else {
            self.schedule(handle);
        }
        Ok(handle)
    }

    /// Moves a `Created` task to `Scheduled` and pushes it to a worker, or
    /// finalizes it immediately if it was cancelled before it could be
    /// scheduled.
    fn schedule(&self, handle: TaskHandle) {
        let Ok(task) = self.tasks.get(handle.0) else {
            return;
        };
        match task.try_schedule() {
            ScheduleAction::Scheduled => self.push_scheduled(handle, &task),
            ScheduleAction::Cancelled => self.finalize_task(handle, &task),
        }
    }

    /// Picks a worker for an already-`Scheduled` task and pushes it there.
    /// Used both by [`Self::schedule`] and by queue re-enable, which
    /// releases `Retained` tasks straight back to `Scheduled` without
    /// running `try_schedule` again.
    fn push_scheduled(&self, handle: TaskHandle, task: &Task) {
        let Ok(action) = self.actions.get(task.action().0) else {
            return;
        };
        let queue = task.queue().and_then(|qh| self.queues.get(qh.0).ok());
        let num_workers = self.num_workers();
        let priority = task.priority().0;

        let mut affinity = action.affinity();
        if let Some(a) = task.affinity() {
            affinity = affinity.intersect(a);
        }
        if let Some(q) = &queue {
            if q.is_ordered() {
                if let Some(qa) = q.affinity() {
                    affinity = affinity.intersect(qa);
                }
            }
        }

        tracing::debug!(task.id = handle.0.id(), priority, "scheduling task");

        if affinity.eq_all(num_workers) {
            let idx = handle.0.id() % num_workers as usize;
            self.workers[idx].push_public_back(priority, handle.0);
            return;
        }

        let bits: Vec<u32> = affinity.iter().filter(|b| *b < num_workers).collect();
        let Some(&idx) = bits.first() else {
            // No worker matches this task's affinity at all; fall back to
            // worker 0 rather than dropping the task on the floor.
            self.workers[0].push_public_back(priority, handle.0);
            return;
        };
        let idx = if bits.len() == 1 {
            idx as usize
        } else if let Ok(job) = self.jobs.get(task.job().0) {
            let cursor = job.next_affinity_cursor(task.priority()) as usize;
            bits[cursor % bits.len()] as usize
        } else {
            idx as usize
        };
        self.workers[idx].push_private_back(priority, handle.0);
    }

    /// Runs one instance of `handle` on the calling (worker) thread, or
    /// finalizes it immediately if it was cancelled or its ordered queue's
    /// execution slot is already taken.
    fn execute_task(&self, handle: TaskHandle) {
        let Ok(task) = self.tasks.get(handle.0) else {
            return;
        };

        if let Some(qh) = task.queue() {
            if let Ok(q) = self.queues.get(qh.0) {
                // A task already carrying the lock got it handed directly
                // from `finalize_task`'s successor promotion and must not
                // attempt to reclaim its own slot — `try_begin_ordered` is
                // not reentrant, so doing so would park it behind itself.
                if q.is_ordered() && !task.holds_ordered_lock() {
                    if q.try_begin_ordered() {
                        task.set_holds_ordered_lock(true);
                    } else {
                        q.park_ordered(handle);
                        return;
                    }
                }
            }
        }

        match task.try_start_running() {
            StartAction::Cancelled => {
                task.mark_cancelled();
                self.finalize_task(handle, &task);
            }
            StartAction::Run => {
                let instance_num = task.next_instance_num();
                let core_num = worker::current_worker().unwrap_or(0);
                let ctx = task.context_for(core_num, instance_num);
                let _span =
                    tracing::trace_span!("poll", task.id = handle.0.id(), instance = instance_num).entered();

                let mut result_buf = Vec::new();
                let outcome = match self.actions.get(task.action().0) {
                    Ok(action) => action.invoke(task.args(), &mut result_buf, &ctx, handle),
                    Err(status) => InvokeOutcome::Finished(Err(status)),
                };

                match outcome {
                    InvokeOutcome::Finished(result) => {
                        let done = task.record_instance_result(result.map(|()| result_buf));
                        if done {
                            self.finalize_task(handle, &task);
                        } else {
                            self.requeue_running_instance(&task, handle);
                        }
                    }
                    InvokeOutcome::Deferred => {
                        tracing::trace!(task.id = handle.0.id(), "deferred to plug-in");
                    }
                }
            }
        }
    }

    /// Re-admits a still-`Running` multi-instance task for its next
    /// instance, bypassing the `Created -> Scheduled` gate.
    fn requeue_running_instance(&self, task: &Task, handle: TaskHandle) {
        let idx = worker::current_worker().unwrap_or(0) as usize % self.workers.len();
        self.workers[idx].push_private_front(task.priority().0, handle.0);
    }

    /// Completes the bookkeeping side of a finished task: pops an ordered
    /// successor, decrements the action/queue inflight counts, and moves
    /// the task into its group's completed FIFO or frees it if detached.
    fn finalize_task(&self, handle: TaskHandle, task: &Task) {
        let outcome = task.finalize();
        let status = match outcome {
            Lifecycle::Completed => Status::Success,
            Lifecycle::Cancelled => Status::ErrActionCancelled,
            Lifecycle::Error => task.error_code().unwrap_or(Status::ErrUnknown),
            _ => Status::ErrUnknown,
        };
        tracing::trace!(task.id = handle.0.id(), ?outcome, "task finalized");

        if let Some(qh) = task.queue() {
            if let Ok(q) = self.queues.get(qh.0) {
                // Hand the lock directly to the next parked task rather than
                // releasing it in between: releasing first would let a
                // brand-new enqueue race the FIFO successor for the slot and
                // break enqueue-order serialization.
                if q.is_ordered() && task.holds_ordered_lock() {
                    match q.pop_ordered_successor() {
                        Some(successor) => match self.tasks.get(successor.0) {
                            Ok(succ_task) => {
                                succ_task.set_holds_ordered_lock(true);
                                let idx = worker::current_worker().unwrap_or(0) as usize % self.workers.len();
                                self.workers[idx].push_private_front(succ_task.priority().0, successor.0);
                            }
                            Err(_) => q.end_ordered(),
                        },
                        None => q.end_ordered(),
                    }
                }
                q.end_task();
            }
        }

        if let Ok(action) = self.actions.get(task.action().0) {
            action.end_task();
        }

        match task.group() {
            Some(gh) => {
                if let Ok(group) = self.groups.get(gh.0) {
                    group.task_completed(handle, status);
                }
            }
            None => {
                if task.is_detached() {
                    let _ = self.tasks.remove(handle.0);
                }
            }
        }
    }

    /// Runs one step of the calling thread's own worker loop if it is a
    /// worker, for depth-one cooperative re-entry from a blocking wait.
    /// Returns `false` (no progress made) on any non-worker thread.
    fn cooperative_step(&self) -> bool {
        let Some(index) = worker::current_worker() else {
            return false;
        };
        match worker::pick_next_task(&self.workers, index as usize, self.scheduling_mode) {
            Some(handle) => {
                self.execute_task(handle);
                true
            }
            None => false,
        }
    }

    fn wait_for(&self, timeout: Timeout, mut predicate: impl FnMut() -> bool) -> Status {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        loop {
            if predicate() {
                return Status::Success;
            }
            if self.cooperative_step() {
                continue;
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    return Status::Timeout;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Blocks until `handle` reaches a terminal state or `timeout` elapses.
    /// A non-detached, non-grouped task is freed from the task pool by the
    /// first successful wait to observe its terminal state.
    pub fn task_wait(&self, handle: TaskHandle, timeout: Timeout) -> Status {
        let task = match self.tasks.get(handle.0) {
            Ok(t) => t,
            Err(e) => return e,
        };
        let status = task.wait(timeout, || self.cooperative_step());
        if status != Status::Timeout && task.group().is_none() && !task.is_detached() {
            let _ = self.tasks.remove(handle.0);
        }
        status
    }

    /// Requests cancellation of `handle`, best-effort forwarding to a
    /// plug-in's cancel callback.
    pub fn task_cancel(&self, handle: TaskHandle) -> Status {
        let task = match self.tasks.get(handle.0) {
            Ok(t) => t,
            Err(e) => return e,
        };
        task.request_cancel();
        if let Ok(action) = self.actions.get(task.action().0) {
            action.request_plugin_cancel(handle);
        }
        Status::Success
    }

    pub fn task_get_attribute(
        &self,
        handle: TaskHandle,
        key: TaskAttributeKey,
    ) -> Result<TaskAttributeValue, Status> {
        let task = self.tasks.get(handle.0)?;
        Ok(match key {
            TaskAttributeKey::IsDetached => TaskAttributeValue::IsDetached(task.is_detached()),
            TaskAttributeKey::NumInstances => TaskAttributeValue::NumInstances(task.num_instances()),
            TaskAttributeKey::Priority => TaskAttributeValue::Priority(task.priority()),
            TaskAttributeKey::Affinity => {
                TaskAttributeValue::Affinity(task.affinity().unwrap_or(Affinity::all(self.num_workers())))
            }
            TaskAttributeKey::ErrorCode => TaskAttributeValue::ErrorCode(task.error_code()),
        })
    }

    /// Delivers a plug-in's asynchronous completion for one instance of
    /// `handle`. Synthesizes the same finalize path `exec_fn` completion
    /// takes. Safe-Rust substitute for the original ABI's raw result
    /// buffer: the plug-in hands back an owned result directly.
    pub fn task_complete(&self, handle: TaskHandle, status: Status, result: Vec<u8>) -> Result<(), Status> {
        let task = self.tasks.get(handle.0)?;
        let outcome = if status.is_success() { Ok(result) } else { Err(status) };
        let done = task.record_instance_result(outcome);
        if done {
            self.finalize_task(handle, &task);
        } else {
            self.requeue_running_instance(&task, handle);
        }
        Ok(())
    }

    pub fn queue_create(&self, job: JobHandle, attrs: QueueAttributes) -> Result<QueueHandle, Status> {
        self.jobs.get(job.0).map_err(|_| Status::ErrJobInvalid)?;
        let queue = Queue::new(job, attrs);
        if queue.priority().0 >= self.max_priorities {
            return Err(Status::ErrAttrNum);
        }
        let raw = self.queues.insert(queue)?;
        Ok(QueueHandle(raw))
    }

    /// Re-enables a disabled queue, re-scheduling every task its
    /// retaining list parked while it was down, in enqueue order.
    pub fn queue_enable(&self, handle: QueueHandle) -> Status {
        let queue = match self.queues.get(handle.0) {
            Ok(q) => q,
            Err(e) => return e,
        };
        queue.set_enabled(true);
        tracing::debug!(queue.id = handle.0.id(), "queue enabled");
        for task_handle in queue.drain_retained() {
            if let Ok(task) = self.tasks.get(task_handle.0) {
                task.release_from_retain();
                self.push_scheduled(task_handle, &task);
            }
        }
        Status::Success
    }

    /// Disables a queue: non-retaining queues cancel their not-yet-started
    /// tasks in place; retaining queues park them instead. Blocks until the
    /// queue's inflight count reaches zero or `timeout` elapses.
    pub fn queue_disable(&self, handle: QueueHandle, timeout: Timeout) -> Status {
        let queue = match self.queues.get(handle.0) {
            Ok(q) => q,
            Err(e) => return e,
        };
        queue.set_enabled(false);
        tracing::debug!(queue.id = handle.0.id(), "queue disabled");

        for task_raw in self.tasks.live_handles() {
            let Ok(task) = self.tasks.get(task_raw) else { continue };
            if task.queue() != Some(handle) {
                continue;
            }
            match task.lifecycle() {
                Lifecycle::Created | Lifecycle::Scheduled => {
                    if queue.is_retaining() {
                        task.park_retained();
                        queue.park_retained(TaskHandle(task_raw));
                    } else {
                        task.request_cancel();
                    }
                }
                Lifecycle::Running => {
                    // Retaining queues only park tasks that haven't started;
                    // a running task keeps running and is accounted for by
                    // `queue.num_tasks()` until it finishes on its own.
                    if !queue.is_retaining() {
                        task.request_cancel();
                    }
                }
                _ => {}
            }
        }

        self.wait_for(timeout, || queue.num_tasks() == 0)
    }

    pub fn queue_delete(&self, handle: QueueHandle, timeout: Timeout) -> Status {
        let queue = match self.queues.get(handle.0) {
            Ok(q) => q,
            Err(e) => return e,
        };
        queue.set_enabled(false);
        let status = self.wait_for(timeout, || queue.num_tasks() == 0);
        if status == Status::Success {
            let _ = self.queues.remove(handle.0);
        }
        status
    }

    pub fn group_create(&self, _attrs: GroupAttributes) -> Result<GroupHandle, Status> {
        let raw = self.groups.insert(Group::new())?;
        Ok(GroupHandle(raw))
    }

    /// Blocks until at least one grouped task completes, freeing it from
    /// the task pool before returning it to the caller.
    pub fn group_wait_any(&self, handle: GroupHandle, timeout: Timeout) -> Result<(TaskHandle, Status), Status> {
        let group = self.groups.get(handle.0)?;
        match group.wait_any(timeout, || self.cooperative_step()) {
            Some((task_handle, status)) => {
                let _ = self.tasks.remove(task_handle.0);
                Ok((task_handle, status))
            }
            None => Err(Status::Timeout),
        }
    }

    /// Blocks until every task ever added to `handle` has a terminal
    /// state, then frees any that were never individually retrieved via
    /// [`Self::group_wait_any`].
    pub fn group_wait_all(&self, handle: GroupHandle, timeout: Timeout) -> Status {
        let group = match self.groups.get(handle.0) {
            Ok(g) => g,
            Err(e) => return e,
        };
        let status = group.wait_all(timeout, || self.cooperative_step());
        if status == Status::Success {
            for (task_handle, _) in group.drain_completed() {
                let _ = self.tasks.remove(task_handle.0);
            }
        }
        status
    }

    pub fn group_delete(&self, handle: GroupHandle) -> Status {
        match self.groups.get(handle.0) {
            Ok(group) => {
                if group.num_inflight() > 0 {
                    return Status::ErrParameter;
                }
                let _ = self.groups.remove(handle.0);
                Status::Success
            }
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    fn teardown() {
        let _ = node_finalize();
    }

    #[test]
    fn sum_action_runs_to_completion() {
        teardown();
        let node = node_init(
            DomainId(0),
            NodeId(0),
            NodeAttributes::new(2).max_priorities(1),
        )
        .unwrap();

        let job = node.job_get(DomainId(0), JobId(1)).unwrap();
        node.action_create(
            JobId(1),
            Box::new(|args, result, _ctx| {
                result.push(args[0] + args[1]);
                Ok(())
            }),
            ActionAttributes::new(node.num_workers()),
        )
        .unwrap();

        let handle = node
            .task_start(job, vec![2, 3], TaskAttributes::new(), None)
            .unwrap();
        let status = node.task_wait(handle, Timeout::Infinite);
        assert_eq!(status, Status::Success);

        teardown();
    }

    #[test]
    fn ordered_queue_serializes_appends() {
        teardown();
        let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(2)).unwrap();

        let job = node.job_get(DomainId(0), JobId(2)).unwrap();
        let acc: StdArc<Mutex<String>> = StdArc::new(Mutex::new(String::new()));
        let acc_clone = StdArc::clone(&acc);
        node.action_create(
            JobId(2),
            Box::new(move |args, _result, _ctx| {
                acc_clone.lock().unwrap().push(args[0] as char);
                Ok(())
            }),
            ActionAttributes::new(node.num_workers()),
        )
        .unwrap();
        let queue = node
            .queue_create(job, QueueAttributes::new().ordered(true))
            .unwrap();

        let mut handles = Vec::new();
        for c in [b'A', b'B', b'C', b'D', b'E'] {
            handles.push(
                node.task_enqueue(queue, vec![c], TaskAttributes::new(), None)
                    .unwrap(),
            );
        }
        for h in handles {
            assert_eq!(node.task_wait(h, Timeout::Infinite), Status::Success);
        }
        assert_eq!(&*acc.lock().unwrap(), "ABCDE");

        teardown();
    }

    #[test]
    fn task_limit_rejects_beyond_capacity() {
        teardown();
        let node = node_init(
            DomainId(0),
            NodeId(0),
            NodeAttributes::new(1).max_tasks(1),
        )
        .unwrap();
        let job = node.job_get(DomainId(0), JobId(3)).unwrap();
        let gate = StdArc::new(AtomicBool::new(false));
        let gate_clone = StdArc::clone(&gate);
        node.action_create(
            JobId(3),
            Box::new(move |_args, _result, ctx| {
                while !gate_clone.load(Ordering::Acquire) && !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            }),
            ActionAttributes::new(node.num_workers()),
        )
        .unwrap();

        let t1 = node.task_start(job, vec![], TaskAttributes::new(), None).unwrap();
        let t2 = node.task_start(job, vec![], TaskAttributes::new(), None);
        assert_eq!(t2, Err(Status::ErrTaskLimit));

        gate.store(true, Ordering::Release);
        assert_eq!(node.task_wait(t1, Timeout::Infinite), Status::Success);

        teardown();
    }

    #[test]
    fn group_wait_all_frees_every_task() {
        teardown();
        let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(2)).unwrap();
        let job = node.job_get(DomainId(0), JobId(4)).unwrap();
        node.action_create(
            JobId(4),
            Box::new(|_args, _result, _ctx| Ok(())),
            ActionAttributes::new(node.num_workers()),
        )
        .unwrap();
        let group = node.group_create(GroupAttributes::new()).unwrap();

        for _ in 0..10 {
            node.task_start(job, vec![], TaskAttributes::new(), Some(group))
                .unwrap();
        }
        assert_eq!(node.group_wait_all(group, Timeout::Infinite), Status::Success);
        assert_eq!(node.info().tasks_live, 0, "no leaked pool slots");

        teardown();
    }
}

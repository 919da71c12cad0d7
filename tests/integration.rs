// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scenarios that need a full running node and don't fit as a `#[cfg(test)]`
//! unit inside a single module: queue disable/enable semantics, plug-in
//! completion, and the hazard-pointer domain under real thread contention.
//!
//! `node_init`/`node_finalize` operate on one process-wide singleton, and
//! this binary's tests run concurrently by default, so every test takes
//! `NODE_LOCK` for its full duration.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use task_rt::action::{ActionAttributes, PluginCallbacks};
use task_rt::group::GroupAttributes;
use task_rt::hazard::HazardPointer;
use task_rt::node::{node_finalize, node_init, NodeAttributes};
use task_rt::queue::QueueAttributes;
use task_rt::task::TaskAttributes;
use task_rt::{DomainId, JobId, NodeId, Status, Timeout};

fn node_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn teardown() {
    let _ = node_finalize();
}

#[test]
fn retaining_queue_parks_enqueued_tasks_until_enabled() {
    let _guard = node_lock().lock().unwrap();
    init_tracing();
    teardown();
    let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(2)).unwrap();

    let job = node.job_get(DomainId(0), JobId(10)).unwrap();
    node.action_create(
        JobId(10),
        Box::new(|_args, _result, _ctx| Ok(())),
        ActionAttributes::new(node.num_workers()),
    )
    .unwrap();
    let queue = node
        .queue_create(job, QueueAttributes::new().retain(true))
        .unwrap();

    assert_eq!(node.queue_disable(queue, Timeout::Millis(1000)), Status::Success);

    let group = node.group_create(GroupAttributes::new()).unwrap();
    for _ in 0..3 {
        node.task_enqueue(queue, vec![], TaskAttributes::new(), Some(group))
            .unwrap();
    }

    // Parked, not cancelled: a short wait must not observe completion.
    assert_eq!(
        node.group_wait_all(group, Timeout::Millis(100)),
        Status::Timeout,
        "retained tasks must not run while their queue is disabled"
    );

    assert_eq!(node.queue_enable(queue), Status::Success);
    assert_eq!(node.group_wait_all(group, Timeout::Millis(1000)), Status::Success);

    teardown();
}

#[test]
fn non_retaining_queue_cancels_pending_tasks_on_disable() {
    let _guard = node_lock().lock().unwrap();
    init_tracing();
    teardown();
    let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(1)).unwrap();

    let job = node.job_get(DomainId(0), JobId(11)).unwrap();
    let running = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let running_clone = Arc::clone(&running);
    let release_clone = Arc::clone(&release);
    node.action_create(
        JobId(11),
        Box::new(move |_args, _result, ctx| {
            running_clone.store(true, Ordering::Release);
            while !release_clone.load(Ordering::Acquire) && !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            if ctx.is_cancelled() {
                Err(Status::ErrActionCancelled)
            } else {
                Ok(())
            }
        }),
        ActionAttributes::new(node.num_workers()),
    )
    .unwrap();
    // Single worker: this queue is not ordered, so it cannot itself
    // serialize the blocker against the pending task. The blocker occupies
    // the one worker thread while the second task sits `Scheduled`.
    let queue = node.queue_create(job, QueueAttributes::new()).unwrap();

    let blocker = node
        .task_enqueue(queue, vec![], TaskAttributes::new(), None)
        .unwrap();
    while !running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(1));
    }

    let pending = node
        .task_enqueue(queue, vec![], TaskAttributes::new(), None)
        .unwrap();

    assert_eq!(node.queue_disable(queue, Timeout::Millis(200)), Status::Timeout);

    release.store(true, Ordering::Release);
    assert_eq!(
        node.task_wait(blocker, Timeout::Infinite),
        Status::ErrActionCancelled,
        "a running task on a non-retaining queue has cancellation requested on disable"
    );
    assert_eq!(
        node.task_wait(pending, Timeout::Infinite),
        Status::ErrActionCancelled,
        "a still-pending task on a non-retaining queue is cancelled, not run, on disable"
    );

    teardown();
}

#[test]
fn plugin_action_completes_via_task_complete() {
    let _guard = node_lock().lock().unwrap();
    init_tracing();
    teardown();
    let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(1)).unwrap();

    let job = node.job_get(DomainId(0), JobId(12)).unwrap();
    let started = Arc::new(AtomicU32::new(0));
    let started_clone = Arc::clone(&started);
    let node_for_start = node.clone();
    let callbacks = PluginCallbacks {
        start: Box::new(move |handle| {
            started_clone.fetch_add(1, Ordering::SeqCst);
            let node_for_start = node_for_start.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let _ = node_for_start.task_complete(handle, Status::Success, vec![7, 8, 9]);
            });
            Status::Success
        }),
        cancel: Box::new(|_handle| {}),
        finalize: Box::new(|| {}),
    };
    node.plugin_action_create(JobId(12), callbacks, ActionAttributes::new(node.num_workers()))
        .unwrap();

    let handle = node.task_start(job, vec![], TaskAttributes::new(), None).unwrap();
    assert_eq!(node.task_wait(handle, Timeout::Infinite), Status::Success);
    assert_eq!(started.load(Ordering::SeqCst), 1);

    teardown();
}

#[test]
fn task_cancel_before_dispatch_yields_cancelled() {
    let _guard = node_lock().lock().unwrap();
    init_tracing();
    teardown();
    let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(1)).unwrap();

    let job = node.job_get(DomainId(0), JobId(13)).unwrap();
    let running = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let running_clone = Arc::clone(&running);
    let release_clone = Arc::clone(&release);
    node.action_create(
        JobId(13),
        Box::new(move |_args, _result, ctx| {
            running_clone.store(true, Ordering::Release);
            while !release_clone.load(Ordering::Acquire) && !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }),
        ActionAttributes::new(node.num_workers()),
    )
    .unwrap();

    let blocker = node.task_start(job, vec![], TaskAttributes::new(), None).unwrap();
    while !running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(1));
    }
    let queued = node.task_start(job, vec![], TaskAttributes::new(), None).unwrap();

    assert_eq!(node.task_cancel(queued), Status::Success);
    release.store(true, Ordering::Release);

    assert_eq!(node.task_wait(blocker, Timeout::Infinite), Status::Success);
    assert_eq!(node.task_wait(queued, Timeout::Infinite), Status::ErrActionCancelled);

    teardown();
}

#[test]
fn hazard_four_threads_see_consistent_state() {
    init_tracing();
    let reclaimed = Arc::new(AtomicU32::new(0));
    let r = Arc::clone(&reclaimed);
    let hp: Arc<HazardPointer<u32>> = Arc::new(HazardPointer::new(2, 4, move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    }));
    let mut handles = Vec::new();

    for t in 0..4u32 {
        let hp = Arc::clone(&hp);
        handles.push(std::thread::spawn(move || {
            for i in 0..200u32 {
                let value = t * 1000 + i;
                hp.guard(0, value).unwrap();
                hp.retire(value).unwrap();
                hp.unguard(0).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    hp.reclaim_all();
    assert_eq!(reclaimed.load(Ordering::SeqCst), 800, "every retired value reclaimed exactly once");
}

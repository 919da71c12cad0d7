// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use task_rt::action::ActionAttributes;
use task_rt::group::GroupAttributes;
use task_rt::node::{node_finalize, node_init, NodeAttributes};
use task_rt::task::TaskAttributes;
use task_rt::{DomainId, JobId, NodeId, Timeout};

fn bench_spawn_single(c: &mut Criterion) {
    let node = node_init(DomainId(0), NodeId(0), NodeAttributes::new(4)).unwrap();
    let job = node.job_get(DomainId(0), JobId(1)).unwrap();
    node.action_create(
        JobId(1),
        Box::new(|_args, _result, _ctx| Ok(())),
        ActionAttributes::new(node.num_workers()),
    )
    .unwrap();

    c.bench_function("spawn_and_wait_single_task", |b| {
        b.iter(|| {
            let handle = node.task_start(job, vec![], TaskAttributes::new(), None).unwrap();
            node.task_wait(handle, Timeout::Infinite)
        });
    });

    node_finalize();
}

fn bench_spawn_batch(c: &mut Criterion) {
    let node = node_init(DomainId(0), NodeId(1), NodeAttributes::new(4)).unwrap();
    let job = node.job_get(DomainId(0), JobId(2)).unwrap();
    node.action_create(
        JobId(2),
        Box::new(|_args, _result, _ctx| Ok(())),
        ActionAttributes::new(node.num_workers()),
    )
    .unwrap();

    c.bench_function("spawn_and_join_1000_tasks", |b| {
        b.iter_batched(
            || node.group_create(GroupAttributes::new()).unwrap(),
            |group| {
                for _ in 0..1000 {
                    node.task_start(job, vec![], TaskAttributes::new(), Some(group))
                        .unwrap();
                }
                node.group_wait_all(group, Timeout::Infinite)
            },
            BatchSize::SmallInput,
        );
    });

    node_finalize();
}

criterion_group!(benches, bench_spawn_single, bench_spawn_batch);
criterion_main!(benches);

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A work-stealing task-scheduling runtime.
//!
//! A [`Node`] owns a fixed pool of worker threads and a set of object pools
//! (actions, jobs, tasks, queues, groups). Tasks are started against a
//! [`Job`](job::Job), routed to a worker by affinity, and executed to
//! completion on whichever worker picks them up. Tasks may be grouped for
//! collective waiting, or enqueued into an ordered/retaining [`Queue`] that
//! serializes their execution.
//!
//! The [`hazard`] module provides a wait-free memory-reclamation primitive
//! (Michael 2004). The scheduler's own FIFOs and object pools are
//! index-based rather than pointer-chasing, so they don't need it, but it's
//! exposed as a standalone building block for lock-free containers that do.

pub mod action;
pub mod error;
pub mod group;
pub mod hazard;
pub mod job;
pub mod node;
pub mod pool;
pub mod queue;
pub mod task;
mod fifo;
mod types;
mod worker;

pub use action::{ActionAttributes, ActionHandle, ExecFn, PluginCallbacks};
pub use error::{Result, Status};
pub use group::{GroupAttributes, GroupHandle};
pub use job::JobHandle;
pub use node::{
    node_finalize, node_get, node_init, Info, Node, NodeAttributes, TaskAttributeKey, TaskAttributeValue,
};
pub use queue::{QueueAttributes, QueueHandle};
pub use task::{TaskAttributes, TaskContext, TaskHandle};
pub use types::{Affinity, DomainId, JobId, NodeId, Priority, Timeout};

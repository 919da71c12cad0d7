// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small value types shared across the public API.

use core::fmt;
use core::time::Duration;

/// A domain identifier. A domain groups nodes that share a `(domain, job_id)`
/// job namespace; this crate assumes a single node per process, but the key
/// is still carried so job lookups match the external interface exactly.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct DomainId(pub u32);

/// A node identifier, scoped within a [`DomainId`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct NodeId(pub u32);

/// A user-chosen identifier mapping to one or more actions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
pub struct JobId(pub u32);

/// A scheduling priority. Lower numbers run first; valid range is
/// `0..max_priorities` as configured on the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Priority(pub u8);

/// A bitmask over workers. A task or action with a non-full affinity mask may
/// only run on workers whose bit is set.
///
/// Limited to 64 workers, which comfortably covers every shared-memory
/// multicore machine this runtime targets; [`NodeAttributes`](crate::node::NodeAttributes)
/// rejects a `core_affinity` wider than that at `node_init`.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Affinity(u64);

impl Affinity {
    /// The affinity matching every worker bit up to `num_workers`.
    #[must_use]
    pub const fn all(num_workers: u32) -> Self {
        if num_workers >= u64::BITS {
            Self(u64::MAX)
        } else {
            Self((1u64 << num_workers) - 1)
        }
    }

    /// The empty affinity, matching no worker.
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// The affinity matching exactly `worker`.
    #[must_use]
    pub const fn worker(worker: u32) -> Self {
        Self(1u64 << worker)
    }

    /// Builds an affinity from a raw bitmask.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Returns the raw bitmask.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub(crate) fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub(crate) fn contains(self, worker: u32) -> bool {
        self.0 & (1u64 << worker) != 0
    }

    /// Iterates the worker indices set in this mask.
    pub(crate) fn iter(self) -> impl Iterator<Item = u32> {
        let bits = self.0;
        (0..u64::BITS).filter(move |b| bits & (1u64 << b) != 0)
    }

    pub(crate) fn eq_all(self, num_workers: u32) -> bool {
        self == Self::all(num_workers)
    }
}

impl fmt::Debug for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Affinity({:#066b})", self.0)
    }
}

/// A wait timeout: either block indefinitely, or give up after a duration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Block until the condition is satisfied, however long that takes.
    Infinite,
    /// Give up and return [`crate::error::Status::Timeout`] after this long.
    Millis(u64),
}

impl Timeout {
    pub(crate) fn as_duration(self) -> Option<Duration> {
        match self {
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

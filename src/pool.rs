// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity, handle-indexed object pool.
//!
//! This is the scheduler's ABA-safe reference scheme: every long-lived
//! scheduler object (actions, jobs, tasks, queues, groups) lives in one of
//! these pools and is referred to elsewhere only by [`Handle`], never by a
//! raw pointer. A `Handle` that outlives its slot's lifetime (freed and
//! reallocated) is caught by the slot's generation tag, following the
//! technique `ksharded-slab`'s `page::slot::Generation` uses.
//!
//! The free list itself is a lock-free Treiber stack of slot indices, after
//! `ksharded-slab`'s `page::stack::TransferStack`: each slot carries its own
//! `next` link, and `free_head` is swung onto it with a
//! `compare_exchange_weak` retry loop, so `insert`/`remove` never block on
//! each other over which slot is free. Only the `Option<Arc<T>>` payload of
//! a single slot is mutex-guarded, so contention is per-slot, not pool-wide.
//!
//! Slots hold `Arc<T>` rather than `T` directly: [`Self::get`] clones the
//! `Arc` out and releases the slot's lock before handing it to the caller,
//! so a long-running operation on one object (e.g. a task's blocking
//! `wait()`) never holds up unrelated `insert`/`remove`/`get` calls on other
//! slots. Every `T` this crate stores here relies on interior mutability
//! (atomics, `Mutex` fields) rather than `&mut self` access.
use core::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Status;

/// Sentinel marking the end of the free list (and an empty list).
const NIL: u32 = u32::MAX;

/// An ABA-safe reference into an [`ObjectPool`]: a slot index paired with a
/// generation tag that is bumped every time the slot is freed and reused.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Handle {
    id: u32,
    tag: u32,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.id, self.tag)
    }
}

impl Handle {
    pub(crate) fn id(self) -> usize {
        self.id as usize
    }
}

struct Slot<T> {
    tag: AtomicU32,
    /// Free-list link: the next free slot's index, or `NIL`. Only
    /// meaningful while this slot is on the free list.
    next: AtomicU32,
    value: Mutex<Option<Arc<T>>>,
}

/// A fixed-size array of `T` plus a free-index pool, addressed through
/// ABA-safe [`Handle`]s.
///
/// Invariant: the number of live handles never exceeds `capacity`.
pub struct ObjectPool<T> {
    capacity: usize,
    slots: Vec<Slot<T>>,
    free_head: AtomicU32,
    len: AtomicUsize,
    invalid_status: Status,
    limit_status: Status,
}

impl<T> ObjectPool<T> {
    /// Creates a pool with room for exactly `capacity` live objects.
    ///
    /// `invalid_status`/`limit_status` let each call site report the
    /// component-specific error (`ErrTaskInvalid` vs `ErrActionInvalid`,
    /// etc.) for the same underlying pool mechanics.
    #[must_use]
    pub fn new(capacity: usize, invalid_status: Status, limit_status: Status) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                tag: AtomicU32::new(0),
                next: AtomicU32::new(NIL),
                value: Mutex::new(None),
            })
            .collect();
        let pool = Self {
            capacity,
            slots,
            free_head: AtomicU32::new(NIL),
            len: AtomicUsize::new(0),
            invalid_status,
            limit_status,
        };
        // Push in descending order so slot 0 ends up on top, matching the
        // allocation order a fresh Vec-backed free list would have given.
        for i in (0..capacity).rev() {
            pool.free_push(u32::try_from(i).expect("pool capacity fits in u32"));
        }
        pool
    }

    /// Pops a free slot index off the lock-free free list, or `None` if the
    /// pool is exhausted.
    fn free_pop(&self) -> Option<u32> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            if head == NIL {
                return None;
            }
            let next = self.slots[head as usize].next.load(Ordering::Relaxed);
            match self
                .free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(head),
                Err(actual) => head = actual,
            }
        }
    }

    /// Pushes a slot index back onto the free list.
    fn free_push(&self, id: u32) {
        let mut head = self.free_head.load(Ordering::Relaxed);
        loop {
            self.slots[id as usize].next.store(head, Ordering::Relaxed);
            match self
                .free_head
                .compare_exchange_weak(head, id, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// The configured capacity of this pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of currently live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves a slot and moves `value` into it, returning a fresh handle.
    ///
    /// Fails with the pool's configured `limit_status` if the pool is full.
    pub fn insert(&self, value: T) -> Result<Handle, Status> {
        let id = self.free_pop().ok_or(self.limit_status)?;
        let slot = &self.slots[id as usize];
        let tag = slot.tag.load(Ordering::Acquire);
        *slot.value.lock().unwrap() = Some(Arc::new(value));
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(Handle { id, tag })
    }

    /// Removes the value at `handle`, bumping the slot's generation tag so
    /// any stale copies of `handle` become invalid. Any `Arc<T>` already
    /// cloned out via [`Self::get`] stays alive until its last holder drops
    /// it; this only removes the pool's own reference.
    pub fn remove(&self, handle: Handle) -> Result<Arc<T>, Status> {
        let slot = self.slots.get(handle.id()).ok_or(self.invalid_status)?;
        if slot.tag.load(Ordering::Acquire) != handle.tag {
            return Err(self.invalid_status);
        }
        let value = slot.value.lock().unwrap().take().ok_or(self.invalid_status)?;
        slot.tag.fetch_add(1, Ordering::AcqRel);
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.free_push(handle.id);
        Ok(value)
    }

    /// Clones out the `Arc<T>` at `handle`, releasing the slot's internal
    /// lock before returning. Fails with `invalid_status` if the handle's
    /// generation tag no longer matches the slot.
    pub fn get(&self, handle: Handle) -> Result<Arc<T>, Status> {
        let slot = self.slots.get(handle.id()).ok_or(self.invalid_status)?;
        if slot.tag.load(Ordering::Acquire) != handle.tag {
            return Err(self.invalid_status);
        }
        slot.value.lock().unwrap().clone().ok_or(self.invalid_status)
    }

    /// Runs `f` against the value at `handle` after the slot's lock has
    /// already been released; see the module docs for why this matters for
    /// callers that may block inside `f`.
    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Result<R, Status> {
        let value = self.get(handle)?;
        Ok(f(&value))
    }

    /// Returns `true` if `handle` still refers to a live slot.
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.slots.get(handle.id()).is_some_and(|s| {
            s.tag.load(Ordering::Acquire) == handle.tag && s.value.lock().unwrap().is_some()
        })
    }

    /// Collects the handles of every currently live slot.
    ///
    /// Used by teardown and by queue/action disable paths that must scan all
    /// live tasks; not on any hot path.
    #[must_use]
    pub fn live_handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, s)| {
                let guard = s.value.lock().unwrap();
                guard.is_some().then(|| Handle {
                    id: u32::try_from(id).expect("pool capacity fits in u32"),
                    tag: s.tag.load(Ordering::Acquire),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_reuses_id_but_not_handle() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(2, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let h1 = pool.insert(1).unwrap();
        pool.remove(h1).unwrap();
        let h2 = pool.insert(2).unwrap();
        assert_eq!(h1.id, h2.id, "slot id is reused");
        assert_ne!(h1, h2, "handle (with tag) must differ");
        assert!(pool.with(h1, |_| ()).is_err());
        assert!(pool.with(h2, |v| *v).unwrap() == 2);
    }

    #[test]
    fn exhausted_pool_reports_limit() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(1, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let _h = pool.insert(1).unwrap();
        assert_eq!(pool.insert(2), Err(Status::ErrTaskLimit));
    }

    #[test]
    fn removed_arc_survives_until_last_holder_drops_it() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(1, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let h = pool.insert(7).unwrap();
        let held = pool.get(h).unwrap();
        pool.remove(h).unwrap();
        assert_eq!(*held, 7);
    }

    #[test]
    fn free_list_survives_concurrent_insert_remove() {
        use std::thread;

        let pool: ObjectPool<u32> = ObjectPool::new(64, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        thread::scope(|s| {
            for t in 0..8u32 {
                s.spawn(|| {
                    for i in 0..200 {
                        if let Ok(h) = pool.insert(t * 1000 + i) {
                            pool.remove(h).unwrap();
                        }
                    }
                });
            }
        });
        assert_eq!(pool.len(), 0);
        // The pool must still be fully usable: every slot reachable again.
        let mut handles = Vec::new();
        for i in 0..64 {
            handles.push(pool.insert(i).unwrap());
        }
        assert_eq!(pool.insert(0), Err(Status::ErrTaskLimit));
        assert_eq!(handles.len(), 64);
    }
}

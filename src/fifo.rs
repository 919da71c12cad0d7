// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker, per-priority task queue.
//!
//! Each worker owns one [`Fifo`] per priority level. The owning worker pops
//! from the front (FIFO order, matching the scheduler's run order within a
//! priority); any worker, including thieves, pushes and steals from the
//! back, treating the queue as MPMC there.
//!
//! A bounded lock-free ring buffer rather than a mutex-guarded deque, in the
//! spirit of the reference crate's `mpsc_queue::MpscQueue` per-worker run
//! queue: `head`/`tail` are plain atomic cursors advanced with
//! `compare_exchange`, and each slot carries its own ready/empty state so a
//! producer publishing into a slot and a consumer claiming it never need a
//! lock to agree on who owns it. Capacity is fixed at construction (sized to
//! the node's task pool, which already bounds how many tasks can be live at
//! once), trading dynamic growth for the lock-free property on the hot
//! push/pop path.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::pool::Handle;

const EMPTY: u8 = 0;
const READY: u8 = 1;

struct Cell {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<Handle>>,
}

// SAFETY: access to `value` is gated by `state`'s READY/EMPTY transitions,
// which are themselves only ever flipped by whichever thread wins the
// `head`/`tail` compare_exchange for that slot index.
unsafe impl Sync for Cell {}

/// A FIFO of task handles belonging to one `(worker, priority)` pair.
pub struct Fifo {
    buf: Box<[Cell]>,
    /// Index of the next slot `pop_front`/`push_front` will touch. Only the
    /// owning worker ever writes this.
    head: AtomicUsize,
    /// Index one past the last occupied slot. Producers (`push_back`) and
    /// thieves (`steal`) both contend here via `compare_exchange`.
    tail: AtomicUsize,
}

impl Fifo {
    /// Creates a FIFO with room for `capacity` pending handles. `capacity`
    /// is rounded up to at least 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let buf = (0..capacity)
            .map(|_| Cell {
                state: AtomicU8::new(EMPTY),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            buf,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn slot(&self, index: usize) -> &Cell {
        &self.buf[index % self.buf.len()]
    }

    /// Pushes a task handle owned by this worker or stolen in by it.
    ///
    /// Spins if the ring is momentarily full; the node's task pool capacity
    /// bounds how many handles can ever be in flight at once, so this is a
    /// transient condition, not a deadlock risk.
    pub fn push_back(&self, handle: Handle) {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= self.buf.len() {
                std::hint::spin_loop();
                continue;
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let cell = self.slot(tail);
                unsafe {
                    (*cell.value.get()).write(handle);
                }
                cell.state.store(READY, Ordering::Release);
                return;
            }
        }
    }

    /// Pushes a task handle to the front, giving it immediate priority over
    /// anything already queued. Used to re-admit an ordered-queue successor.
    /// Only ever called by the owning worker, so `head` needs no CAS here.
    pub fn push_front(&self, handle: Handle) {
        let new_head = self.head.load(Ordering::Relaxed).wrapping_sub(1);
        let cell = self.slot(new_head);
        unsafe {
            (*cell.value.get()).write(handle);
        }
        cell.state.store(READY, Ordering::Release);
        self.head.store(new_head, Ordering::Release);
    }

    /// The owning worker's dequeue operation: take the oldest task.
    pub fn pop_front(&self) -> Option<Handle> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let cell = self.slot(head);
            if cell.state.load(Ordering::Acquire) != READY {
                // A producer has reserved this slot but not yet published
                // into it; treat as momentarily empty rather than spin
                // forever on the owner's own hot path.
                return None;
            }
            let value = unsafe { (*cell.value.get()).assume_init_read() };
            cell.state.store(EMPTY, Ordering::Release);
            self.head.store(head.wrapping_add(1), Ordering::Release);
            return Some(value);
        }
    }

    /// A thief's dequeue operation: take the newest task, so the victim's
    /// own `pop_front` and a thief's `steal` never race for the same end.
    pub fn steal(&self) -> Option<Handle> {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail == head {
                return None;
            }
            let idx = tail.wrapping_sub(1);
            let cell = self.slot(idx);
            if cell.state.load(Ordering::Acquire) != READY {
                return None;
            }
            if self
                .tail
                .compare_exchange_weak(tail, idx, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*cell.value.get()).assume_init_read() };
                cell.state.store(EMPTY, Ordering::Release);
                return Some(value);
            }
            // Lost the race to another thief or a concurrent push_back; retry.
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::pool::ObjectPool;

    #[test]
    fn push_pop_is_fifo_order() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(4, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let h1 = pool.insert(1).unwrap();
        let h2 = pool.insert(2).unwrap();

        let fifo = Fifo::new(4);
        fifo.push_back(h1);
        fifo.push_back(h2);
        assert_eq!(fifo.pop_front(), Some(h1));
        assert_eq!(fifo.pop_front(), Some(h2));
        assert_eq!(fifo.pop_front(), None);
    }

    #[test]
    fn steal_takes_from_opposite_end() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(4, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let h1 = pool.insert(1).unwrap();
        let h2 = pool.insert(2).unwrap();

        let fifo = Fifo::new(4);
        fifo.push_back(h1);
        fifo.push_back(h2);
        assert_eq!(fifo.steal(), Some(h2));
        assert_eq!(fifo.pop_front(), Some(h1));
    }

    #[test]
    fn push_front_is_served_before_everything_else() {
        let pool: ObjectPool<u32> =
            ObjectPool::new(4, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let h1 = pool.insert(1).unwrap();
        let h2 = pool.insert(2).unwrap();

        let fifo = Fifo::new(4);
        fifo.push_back(h1);
        fifo.push_front(h2);
        assert_eq!(fifo.pop_front(), Some(h2));
        assert_eq!(fifo.pop_front(), Some(h1));
    }

    #[test]
    fn concurrent_push_and_steal_never_duplicate_or_lose_handles() {
        use std::collections::HashSet;
        use std::sync::Mutex;
        use std::thread;

        let pool: ObjectPool<u32> =
            ObjectPool::new(256, Status::ErrTaskInvalid, Status::ErrTaskLimit);
        let handles: Vec<Handle> = (0..200).map(|i| pool.insert(i).unwrap()).collect();
        let fifo = Fifo::new(256);
        let seen = Mutex::new(HashSet::new());

        thread::scope(|s| {
            for chunk in handles.chunks(50) {
                s.spawn(move || {
                    for h in chunk {
                        fifo.push_back(*h);
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(h) = fifo.steal().or_else(|| fifo.pop_front()) {
                        seen.lock().unwrap().insert(h);
                    }
                });
            }
        });

        // Drain anything a thief's thread exited on right before a late push.
        while let Some(h) = fifo.pop_front() {
            seen.lock().unwrap().insert(h);
        }

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), handles.len(), "every handle observed exactly once");
    }
}

// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hazard-pointer memory reclamation (Michael 2004).
//!
//! Hazard pointers are a wait-free reclamation scheme for lock-free
//! algorithms: they act as a small garbage collector for the structures
//! elsewhere in this crate that must free nodes while other threads may
//! still be dereferencing them (the internal queue/group linked lists).
//!
//! A thread that wants to dereference a pointer first *guards* it by
//! publishing it into one of its own hazard slots. From then on the
//! reclaimer will not free that value until the guard is lifted. A thread
//! that wants to free a value instead *retires* it: if no slot anywhere
//! guards it, it is dropped immediately; otherwise it is appended to that
//! thread's retired list and swept later.
//!
//! This differs from the original in one respect: instead of each caller
//! supplying a raw "thread count" and indexing into global arrays by OS
//! thread id, registration happens lazily the first time a thread calls
//! [`HazardPointer::guard`] or [`HazardPointer::retire`], capped at
//! `max_accessors`.
//!
//! The release callback is supplied once, at construction, exactly as the
//! original's constructor takes it as a member. `Drop` runs
//! [`Self::reclaim_all`] automatically, so a caller who lets the domain go
//! out of scope never leaks whatever is still on a retired list.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

use crate::error::Status;

/// A lock-free reclamation domain over values of type `T`.
///
/// `T` must be cheap to compare for hazard matching; this crate instantiates
/// it with small `Copy` handle/pointer-sized types.
pub struct HazardPointer<T> {
    guards_per_thread: usize,
    max_accessors: usize,
    /// `thread_id_mapping[i]` is the OS thread registered to row `i`, if any.
    rows: Vec<Mutex<Row<T>>>,
    next_row: AtomicUsize,
    reclaim: Box<dyn Fn(T) + Send + Sync>,
}

struct Row<T> {
    owner: Option<ThreadId>,
    guards: Vec<Option<T>>,
    retired: Vec<T>,
}

impl<T: Copy + Eq> HazardPointer<T> {
    /// Creates a reclamation domain supporting up to `max_accessors`
    /// concurrently-registered threads, each with `guards_per_thread` guard
    /// slots. `reclaim` runs on every value this domain ever frees, whether
    /// via [`Self::retire`], [`Self::reclaim_all`], or automatically on
    /// `Drop`.
    #[must_use]
    pub fn new(
        guards_per_thread: usize,
        max_accessors: usize,
        reclaim: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        let rows = (0..max_accessors)
            .map(|_| {
                Mutex::new(Row {
                    owner: None,
                    guards: vec![None; guards_per_thread],
                    retired: Vec::new(),
                })
            })
            .collect();
        Self {
            guards_per_thread,
            max_accessors,
            rows,
            next_row: AtomicUsize::new(0),
            reclaim: Box::new(reclaim),
        }
    }

    /// The maximum number of retired-but-unreclaimed objects this domain can
    /// hold at once, as the original's `ComputeMaximumRetiredObjectCount`:
    /// `guards_per_thread * accessors^2`. Callers that pre-size a backing
    /// pool use this to size it large enough that reclamation never blocks
    /// forward progress.
    #[must_use]
    pub fn max_retired(&self) -> usize {
        self.guards_per_thread * self.max_accessors * self.max_accessors
    }

    fn row_for_current_thread(&self) -> Result<usize, Status> {
        let tid = std::thread::current().id();
        for (i, row) in self.rows.iter().enumerate() {
            if row.lock().unwrap().owner == Some(tid) {
                return Ok(i);
            }
        }
        loop {
            let next = self.next_row.load(Ordering::Relaxed);
            if next >= self.max_accessors {
                return Err(Status::ErrTooManyAccessors);
            }
            if self
                .next_row
                .compare_exchange(next, next + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.rows[next].lock().unwrap().owner = Some(tid);
                return Ok(next);
            }
        }
    }

    /// Publishes `value` into the calling thread's guard slot `guard_position`,
    /// preventing it from being reclaimed by any thread's [`Self::retire`]
    /// until [`Self::unguard`] releases the same slot.
    ///
    /// Per the original's guard-and-check discipline: the caller must
    /// re-validate that `value` is still the current pointer/handle *after*
    /// guarding it, looping back to `guard` with the fresh value if not.
    pub fn guard(&self, guard_position: usize, value: T) -> Result<(), Status> {
        debug_assert!(guard_position < self.guards_per_thread);
        let row = self.row_for_current_thread()?;
        self.rows[row].lock().unwrap().guards[guard_position] = Some(value);
        Ok(())
    }

    /// Lifts the guard placed by [`Self::guard`] on `guard_position`.
    pub fn unguard(&self, guard_position: usize) -> Result<(), Status> {
        debug_assert!(guard_position < self.guards_per_thread);
        let row = self.row_for_current_thread()?;
        self.rows[row].lock().unwrap().guards[guard_position] = None;
        Ok(())
    }

    /// Retires `value`: if no thread currently guards it, the domain's
    /// `reclaim` callback runs on it immediately; otherwise it is appended
    /// to the calling thread's retired list and reclaimed on some later
    /// call to `retire` once its last guard is lifted.
    ///
    /// There is no threshold as in some hazard-pointer variants: this
    /// domain sweeps on every call, trading a constant-factor scan cost for
    /// the smallest possible memory footprint, matching the original's
    /// stated design choice.
    pub fn retire(&self, value: T) -> Result<(), Status> {
        let row = self.row_for_current_thread()?;
        let still_guarded = self.is_guarded_anywhere(value);
        if still_guarded {
            self.rows[row].lock().unwrap().retired.push(value);
        } else {
            (self.reclaim)(value);
        }
        self.sweep_own_retired_list(row);
        Ok(())
    }

    fn is_guarded_anywhere(&self, value: T) -> bool {
        self.rows
            .iter()
            .any(|r| r.lock().unwrap().guards.iter().any(|g| *g == Some(value)))
    }

    fn sweep_own_retired_list(&self, row: usize) {
        let mut still_retired = Vec::new();
        let retired = std::mem::take(&mut self.rows[row].lock().unwrap().retired);
        for value in retired {
            if self.is_guarded_anywhere(value) {
                still_retired.push(value);
            } else {
                (self.reclaim)(value);
            }
        }
        self.rows[row].lock().unwrap().retired = still_retired;
    }

    /// Drops every still-retired object across all threads, running
    /// `reclaim` on each regardless of outstanding guards. Only correct to
    /// call when no other thread can still be dereferencing these values,
    /// i.e. during teardown of the owning structure. Also run automatically
    /// by `Drop`.
    pub fn reclaim_all(&self) {
        for row in &self.rows {
            let mut row = row.lock().unwrap();
            for value in row.retired.drain(..) {
                (self.reclaim)(value);
            }
        }
    }
}

impl<T: Copy + Eq> Drop for HazardPointer<T> {
    fn drop(&mut self) {
        self.reclaim_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn unguarded_retire_reclaims_immediately() {
        let reclaimed = Arc::new(AtomicU32::new(0));
        let r = reclaimed.clone();
        let hp: HazardPointer<u32> = HazardPointer::new(2, 4, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        hp.retire(42).unwrap();
        assert_eq!(reclaimed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guarded_retire_defers_until_unguarded() {
        let reclaimed = Arc::new(AtomicU32::new(0));
        let r = reclaimed.clone();
        let hp: HazardPointer<u32> = HazardPointer::new(2, 4, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        hp.guard(0, 7).unwrap();
        hp.retire(7).unwrap();
        assert_eq!(reclaimed.load(Ordering::SeqCst), 0, "still guarded");

        hp.unguard(0).unwrap();
        hp.retire(99).unwrap();
        assert_eq!(
            reclaimed.load(Ordering::SeqCst),
            2,
            "sweeping the retired list on the next retire call should free 7 and 99"
        );
    }

    #[test]
    fn too_many_accessors_is_reported() {
        let hp: HazardPointer<u32> = HazardPointer::new(1, 1, |_| {});
        hp.guard(0, 1).unwrap();
        let result = std::thread::spawn(move || hp.guard(0, 2)).join().unwrap();
        assert_eq!(result, Err(Status::ErrTooManyAccessors));
    }

    #[test]
    fn drop_reclaims_outstanding_retired_values() {
        let reclaimed = Arc::new(AtomicU32::new(0));
        let r = reclaimed.clone();
        {
            let hp: HazardPointer<u32> = HazardPointer::new(2, 4, move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            });
            hp.guard(0, 1).unwrap();
            hp.retire(1).unwrap();
            assert_eq!(reclaimed.load(Ordering::SeqCst), 0, "still guarded");
            hp.unguard(0).unwrap();
        }
        assert_eq!(reclaimed.load(Ordering::SeqCst), 1, "drop reclaims what retire deferred");
    }
}

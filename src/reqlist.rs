//! Request List (spec.md §4.B): an intrusive set of in-flight byte-range
//! reservations, each with a FIFO wait queue woken on `shrink`/`remove`.
//!
//! Unlike a self-locking collection, a `RequestList` carries no lock of its
//! own — per spec.md §5 it always lives inside some other owner's mutex (the
//! block-copy engine's `in_flight_reqs`, the CBW filter's `frozen_read_reqs`).
//! Waiting therefore happens in two steps at the call site: look up the
//! conflicting request while holding the owner's lock, then hand that
//! request and the lock guard to `wait_on_req`, which parks on the request's
//! own condvar and releases the guard for the duration — mirroring the
//! original's `reqlist_wait_one(req, bs->reqs_lock)` taking the owner's
//! `CoMutex`. Grounded in `examples/original_source/block/reqlist.c`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, MutexGuard};

/// One reserved, currently-copying-or-reading interval.
pub struct ReqEntry {
    offset: u64,
    bytes: AtomicU64,
    wait_queue: Condvar,
}

impl ReqEntry {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn overlaps(&self, off: u64, bytes: u64) -> bool {
        let (a0, a1) = (self.offset, self.offset + self.bytes());
        let (b0, b1) = (off, off + bytes);
        a0 < b1 && b0 < a1
    }
}

pub type ReqHandle = Arc<ReqEntry>;

/// An intrusive list of non-owning `ReqHandle`s. Reached only while the
/// caller's own lock is held (see module docs).
#[derive(Default)]
pub struct RequestList {
    reqs: Vec<ReqHandle>,
}

impl RequestList {
    pub fn new() -> Self {
        RequestList { reqs: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    /// Returns any currently-reserved interval overlapping `[off, off+bytes)`.
    pub fn find_conflict(&self, off: u64, bytes: u64) -> Option<ReqHandle> {
        self.reqs.iter().find(|r| r.overlaps(off, bytes)).cloned()
    }

    /// Reserves `[off, off+bytes)`. The caller is responsible for having
    /// already proven via `find_conflict` that nothing overlaps; this
    /// mirrors the original's `reqlist_init_req`, which merely asserts.
    pub fn insert(&mut self, off: u64, bytes: u64) -> ReqHandle {
        debug_assert!(
            self.find_conflict(off, bytes).is_none(),
            "conflict-free insertion invariant violated"
        );
        let req = Arc::new(ReqEntry {
            offset: off,
            bytes: AtomicU64::new(bytes),
            wait_queue: Condvar::new(),
        });
        self.reqs.push(req.clone());
        req
    }

    /// Shrinks `req`'s interval (e.g. when the engine caps a copy step by
    /// `copy_size`) and wakes every waiter so they can re-evaluate.
    pub fn shrink(&self, req: &ReqHandle, new_bytes: u64) {
        let old = req.bytes();
        assert!(new_bytes > 0 && new_bytes < old, "shrink must strictly narrow the request");
        req.bytes.store(new_bytes, Ordering::Release);
        req.wait_queue.notify_all();
    }

    /// Unlinks `req` and wakes all its waiters. Per spec.md §4.B, no waiter
    /// suspended on `req.wait_queue` is left stranded: `notify_all` happens
    /// before the handle is dropped from the list.
    pub fn remove(&mut self, req: &ReqHandle) {
        req.wait_queue.notify_all();
        if let Some(idx) = self.reqs.iter().position(|r| Arc::ptr_eq(r, req)) {
            self.reqs.swap_remove(idx);
        }
    }
}

/// Parks the current thread on `req`'s wait queue, releasing `guard` for the
/// duration and re-acquiring it before returning. Callers loop
/// `find_conflict` / `wait_on_req` until `find_conflict` comes back empty
/// (the `wait_all` behavior of spec.md §4.B); a single call is the `wait_one`
/// behavior. Takes the already-resolved handle rather than the list itself
/// so the immutable lookup borrow is released before the mutable wait.
pub fn wait_on_req<T>(req: &ReqHandle, guard: &mut MutexGuard<'_, T>) {
    req.wait_queue.wait(guard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc as StdArc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn find_conflict_detects_overlap_and_disjoint_ranges() {
        let mut list = RequestList::new();
        let r = list.insert(10, 10); // [10, 20)
        assert!(list.find_conflict(15, 10).is_some()); // [15, 25) overlaps
        assert!(list.find_conflict(20, 10).is_none()); // [20, 30) disjoint
        list.remove(&r);
        assert!(list.find_conflict(15, 10).is_none());
    }

    #[test]
    #[should_panic]
    fn insert_over_existing_conflict_panics_in_debug() {
        let mut list = RequestList::new();
        list.insert(0, 10);
        list.insert(5, 10);
    }

    #[test]
    #[should_panic]
    fn shrink_rejects_non_narrowing_values() {
        let mut list = RequestList::new();
        let req = list.insert(0, 10);
        list.shrink(&req, 10);
    }

    #[test]
    fn waiter_is_woken_on_remove() {
        let state = StdArc::new(Mutex::new(RequestList::new()));
        let req = state.lock().insert(0, 64 << 10);

        let waiter_state = state.clone();
        let waiter = thread::spawn(move || {
            let mut guard = waiter_state.lock();
            loop {
                let conflict = guard.find_conflict(0, 64 << 10);
                match conflict {
                    Some(req) => wait_on_req(&req, &mut guard),
                    None => break,
                }
            }
        });

        thread::sleep(Duration::from_millis(20));
        state.lock().remove(&req);
        waiter.join().unwrap();
    }
}

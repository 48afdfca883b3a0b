//! Copy-Before-Write filter (spec.md §4.D). Grounded in
//! `examples/original_source/block/copy-before-write.c`: the filter sits
//! above `source`, mirrors every destructive write into `target` via the
//! block-copy engine before letting it reach `source`, and exposes a
//! point-in-time snapshot view (`*_snapshot` methods) to external fleecing
//! readers.

use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::warn;

use crate::bitmap::DirtyBitmap;
use crate::block_copy::BlockCopyState;
use crate::error::{Error, Result};
use crate::node::{BlockNode, WriteFlags};
use crate::reqlist::{wait_on_req, RequestList};

/// What happens when the background copy-before-write fails (spec.md §4.D).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OnCbwError {
    /// The guest write itself fails; the snapshot side is left untouched.
    BreakGuestWrite,
    /// The guest write still succeeds; the snapshot side is poisoned with a
    /// sticky error from this point on.
    BreakSnapshot,
}

impl Default for OnCbwError {
    fn default() -> Self {
        OnCbwError::BreakGuestWrite
    }
}

bitflags! {
    /// Permission bitset on a child edge (spec.md §9, §4.D's sharing
    /// contract). Not enforced by a graph here — this crate has no
    /// block-graph permission recomputation pass — but computed the same
    /// way the original's `cbw_child_perm` does, for a caller that owns one.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct ChildPerm: u32 {
        const CONSISTENT_READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_UNCHANGED = 1 << 2;
        const RESIZE = 1 << 3;
    }
}

struct FilterState {
    access_bitmap: DirtyBitmap,
    done_bitmap: DirtyBitmap,
    frozen_read_reqs: RequestList,
    /// Sticky error message captured the first time a `BreakSnapshot`
    /// copy-before-write fails (spec.md §3, invariant ix). Stored as text
    /// rather than the original `Error` since the latter is not `Clone`
    /// (it wraps `std::io::Error`); every subsequent snapshot-side call
    /// reconstructs a fresh `Error::SnapshotPoisoned` from it.
    snapshot_error: Option<String>,
}

/// A block-driver node interposed between a guest-visible `source` and a
/// backup `target` (spec.md §4.D).
pub struct CbwFilter {
    source: Arc<dyn BlockNode>,
    target: Arc<dyn BlockNode>,
    bcs: Arc<BlockCopyState>,
    on_cbw_error: OnCbwError,
    cbw_timeout: Option<Duration>,
    state: Mutex<FilterState>,
}

impl CbwFilter {
    pub fn new(
        source: Arc<dyn BlockNode>,
        target: Arc<dyn BlockNode>,
        bitmap: Option<&DirtyBitmap>,
        discard_source: bool,
        min_cluster_size: u64,
        on_cbw_error: OnCbwError,
        cbw_timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        if target.size() != source.size() {
            return Err(Error::BadArgument("target size must equal source size".into()));
        }
        let bcs = BlockCopyState::new(source.clone(), target.clone(), bitmap, discard_source, min_cluster_size)?;
        let size = source.size();
        let cluster_size = bcs.cluster_size();

        // access_bitmap starts as a copy of copy_bitmap (invariant viii):
        // a cluster not yet scheduled for copy is not yet readable by a
        // fleecing reader either.
        let mut access_bitmap = DirtyBitmap::new(size, cluster_size)?;
        if bitmap.is_none() {
            access_bitmap.set(0, size)?;
        } else {
            bitmap.unwrap().merge_into(&mut access_bitmap)?;
        }
        let done_bitmap = DirtyBitmap::new(size, cluster_size)?;

        Ok(Arc::new(CbwFilter {
            source,
            target,
            bcs,
            on_cbw_error,
            cbw_timeout,
            state: Mutex::new(FilterState {
                access_bitmap,
                done_bitmap,
                frozen_read_reqs: RequestList::new(),
                snapshot_error: None,
            }),
        }))
    }

    pub fn block_copy_state(&self) -> &Arc<BlockCopyState> {
        &self.bcs
    }

    /// Permissions this filter should hold on `source`/`target`, and what it
    /// shares with siblings (spec.md §4.D). `(source_perm, source_shared,
    /// target_perm, target_shared)`.
    pub fn child_perms(&self, discard_source: bool) -> (ChildPerm, ChildPerm, ChildPerm, ChildPerm) {
        let all = ChildPerm::all();
        let mut source_perm = ChildPerm::CONSISTENT_READ;
        if discard_source {
            source_perm |= ChildPerm::WRITE;
        }
        let source_shared = all & !(ChildPerm::WRITE | ChildPerm::RESIZE);
        let target_perm = ChildPerm::WRITE;
        let target_shared = all & !ChildPerm::RESIZE;
        (source_perm, source_shared, target_perm, target_shared)
    }

    // ---- guest-facing vtable (spec.md §4.D) ----

    pub fn preadv(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.source.preadv(off, buf)
    }

    pub fn pwritev(&self, off: u64, buf: &[u8], flags: WriteFlags) -> Result<()> {
        self.do_copy_before_write(off, buf.len() as u64, flags)?;
        self.source.pwritev(off, buf, flags)
    }

    pub fn pwrite_zeroes(&self, off: u64, len: u64, flags: WriteFlags) -> Result<()> {
        self.do_copy_before_write(off, len, flags)?;
        self.source.pwrite_zeroes(off, len, flags)
    }

    pub fn pdiscard(&self, off: u64, len: u64) -> Result<()> {
        self.do_copy_before_write(off, len, WriteFlags::empty())?;
        self.source.pdiscard(off, len)
    }

    pub fn flush(&self) -> Result<()> {
        self.source.flush()
    }

    /// `cbw_do_copy_before_write` (spec.md §4.D numbered algorithm).
    fn do_copy_before_write(&self, off: u64, len: u64, flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::WRITE_UNCHANGED) {
            return Ok(());
        }
        if self.state.lock().snapshot_error.is_some() {
            return Ok(());
        }

        let (a, b) = self.bcs.align_to_cluster(off, len);
        match self.bcs.copy(a, b - a, true, self.cbw_timeout) {
            Ok(()) => {
                let mut guard = self.state.lock();
                guard.done_bitmap.set(a, b - a)?;
                loop {
                    let conflict = guard.frozen_read_reqs.find_conflict(a, b - a);
                    match conflict {
                        Some(req) => wait_on_req(&req, &mut guard),
                        None => break,
                    }
                }
                Ok(())
            }
            Err(e) => match self.on_cbw_error {
                OnCbwError::BreakGuestWrite => Err(e),
                OnCbwError::BreakSnapshot => {
                    let mut guard = self.state.lock();
                    if guard.snapshot_error.is_none() {
                        warn!(error = %e, "copy-before-write failed, poisoning snapshot side");
                        guard.snapshot_error = Some(e.to_string());
                    }
                    Ok(())
                }
            },
        }
    }

    // ---- snapshot-facing vtable (spec.md §4.D) ----

    pub fn preadv_snapshot(&self, off: u64, len: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, len);
        if let Some(err) = self.sticky_snapshot_error() {
            return Err(err);
        }
        if !self.access_covers(off, len) {
            return Err(Error::PermissionDenied);
        }

        let mut cursor = off;
        let end = off + len;
        while cursor < end {
            let mut guard = self.state.lock();
            let done = guard.done_bitmap.get(cursor);
            let extent_end = if done {
                guard.done_bitmap.next_zero(cursor, end).unwrap_or(end)
            } else {
                guard.done_bitmap.next_dirty(cursor, end).unwrap_or(end)
            };
            let extent_len = extent_end - cursor;
            let buf_slice = &mut buf[(cursor - off) as usize..(extent_end - off) as usize];

            if done {
                drop(guard);
                self.target.preadv(cursor, buf_slice)?;
            } else {
                let req = guard.frozen_read_reqs.insert(cursor, extent_len);
                drop(guard);
                let result = self.source.preadv(cursor, buf_slice);
                let mut guard = self.state.lock();
                guard.frozen_read_reqs.remove(&req);
                drop(guard);
                result?;
            }
            cursor = extent_end;
        }
        Ok(())
    }

    /// Aligns inward to the cluster size, then resets `access_bitmap` and
    /// the engine's `copy_bitmap`, and only then discards `target`
    /// (SPEC_FULL.md §10.4 / second Open Question).
    pub fn pdiscard_snapshot(&self, off: u64, len: u64) -> Result<()> {
        let c = self.bcs.cluster_size();
        let start = off.div_ceil(c) * c;
        let end = (off + len) / c * c;
        if start >= end {
            return Ok(());
        }
        {
            let mut guard = self.state.lock();
            guard.access_bitmap.reset(start, end - start)?;
            self.bcs.reset(start, end - start)?;
        }
        self.target.pdiscard(start, end - start)
    }

    /// Returns `(start, len, served_from_target)` extents covering
    /// `[off, len)`, using the same selection rule as `preadv_snapshot`. A
    /// fleecing status query almost always straddles a single done/not-done
    /// boundary, so this stays on the stack for the common case (teacher's
    /// `hvc.rs` uses the same `SmallVec` sizing for per-call segment lists).
    pub fn snapshot_block_status(&self, off: u64, len: u64) -> Result<SmallVec<[(u64, u64, bool); 4]>> {
        if let Some(err) = self.sticky_snapshot_error() {
            return Err(err);
        }
        if !self.access_covers(off, len) {
            return Err(Error::PermissionDenied);
        }
        let mut out = SmallVec::new();
        let mut cursor = off;
        let end = off + len;
        let guard = self.state.lock();
        while cursor < end {
            let done = guard.done_bitmap.get(cursor);
            let extent_end = if done {
                guard.done_bitmap.next_zero(cursor, end).unwrap_or(end)
            } else {
                guard.done_bitmap.next_dirty(cursor, end).unwrap_or(end)
            };
            out.push((cursor, extent_end - cursor, done));
            cursor = extent_end;
        }
        Ok(out)
    }

    fn access_covers(&self, off: u64, len: u64) -> bool {
        self.state.lock().access_bitmap.is_fully_set(off, len)
    }

    fn sticky_snapshot_error(&self) -> Option<Error> {
        self.state
            .lock()
            .snapshot_error
            .as_ref()
            .map(|msg| Error::SnapshotPoisoned(msg.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemNode;

    fn new_filter(size: u64, gran: u64) -> (Arc<MemNode>, Arc<MemNode>, Arc<CbwFilter>) {
        let source = Arc::new(MemNode::new(size, gran));
        let target = Arc::new(MemNode::new(size, gran));
        source.fill(0xAA);
        let filter = CbwFilter::new(
            source.clone(),
            target.clone(),
            None,
            false,
            gran,
            OnCbwError::BreakGuestWrite,
            None,
        )
        .unwrap();
        (source, target, filter)
    }

    #[test]
    fn guest_write_copies_old_contents_before_applying() {
        let (source, target, filter) = new_filter(1 << 20, 64 << 10);
        filter.pwritev(64 << 10, &[0xBB; 64 << 10], WriteFlags::empty()).unwrap();

        let mut buf = vec![0u8; 64 << 10];
        filter.preadv_snapshot(64 << 10, 64 << 10, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));

        let mut direct = vec![0u8; 64 << 10];
        source.preadv(64 << 10, &mut direct).unwrap();
        assert!(direct.iter().all(|&b| b == 0xBB));
        let _ = target;
    }

    #[test]
    fn snapshot_read_outside_access_bitmap_is_denied() {
        let (_source, _target, filter) = new_filter(1 << 20, 64 << 10);
        filter.pdiscard_snapshot(0, 64 << 10).unwrap();
        let mut buf = vec![0u8; 64 << 10];
        let err = filter.preadv_snapshot(0, 64 << 10, &mut buf).unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
    }

    #[test]
    fn break_snapshot_poisons_snapshot_but_not_guest_write() {
        let source = Arc::new(MemNode::new(1 << 20, 64 << 10));
        let target = Arc::new(MemNode::new(1 << 20, 64 << 10));
        source.fill(0xAA);
        target.inject_write_failure(64 << 10, 64 << 10);
        let filter = CbwFilter::new(
            source.clone(),
            target,
            None,
            false,
            64 << 10,
            OnCbwError::BreakSnapshot,
            None,
        )
        .unwrap();

        filter
            .pwritev(64 << 10, &[0xBB; 64 << 10], WriteFlags::empty())
            .expect("guest write must succeed under break-snapshot policy");

        let mut buf = vec![0u8; 64 << 10];
        assert!(filter.preadv_snapshot(0, 64 << 10, &mut buf).is_err());

        let mut direct = vec![0u8; 64 << 10];
        source.preadv(64 << 10, &mut direct).unwrap();
        assert!(direct.iter().all(|&b| b == 0xBB));
    }
}

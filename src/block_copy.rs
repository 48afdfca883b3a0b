//! Block-Copy Engine (spec.md §4.C): the cluster-granular source→target
//! copier shared by the CBW filter's foreground path and the backup job's
//! background pass. Grounded in `examples/original_source/block/backup.c`
//! (cluster-size derivation, `copy_size` capping) and
//! `examples/original_source/include/block/block-copy.h`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bitmap::DirtyBitmap;
use crate::error::{Error, Result};
use crate::node::{BlockNode, WriteFlags};
use crate::reqlist::{wait_on_req, RequestList};

/// Upper bound on the per-iteration extent, independent of cluster size
/// (SPEC_FULL.md §10.1).
pub const MAX_COPY_SIZE: u64 = 16 << 20;

const SECTOR_SIZE: u64 = 512;

fn round_up_pow2(v: u64) -> u64 {
    if v <= 1 {
        return 1;
    }
    1u64 << (64 - (v - 1).leading_zeros())
}

/// Byte-counter sink, invoked once per extent actually transferred (or
/// skipped via `skip_unallocated`), post-read/pre-bitmap-clear
/// (SPEC_FULL.md §10.2).
pub trait ProgressSink: Send {
    fn on_progress(&mut self, bytes: u64);
}

impl<F: FnMut(u64) + Send> ProgressSink for F {
    fn on_progress(&mut self, bytes: u64) {
        self(bytes)
    }
}

struct Inner {
    copy_bitmap: DirtyBitmap,
    in_flight: RequestList,
    skip_unallocated: bool,
}

struct InFlightCounter {
    count: Mutex<u64>,
    drained: Condvar,
}

impl InFlightCounter {
    fn new() -> Self {
        InFlightCounter {
            count: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn inc(&self) {
        *self.count.lock() += 1;
    }

    fn dec(&self) {
        let mut g = self.count.lock();
        *g -= 1;
        if *g == 0 {
            self.drained.notify_all();
        }
    }

    /// Blocks until every started operation — including timed-out copies
    /// whose background thread hasn't finished yet — has delivered a
    /// completion (spec.md §5).
    fn drain(&self) {
        let mut g = self.count.lock();
        while *g > 0 {
            self.drained.wait(&mut g);
        }
    }
}

/// Cluster-granular source→target copier (spec.md §4.C).
pub struct BlockCopyState {
    source: Arc<dyn BlockNode>,
    target: Arc<dyn BlockNode>,
    cluster_size: u64,
    copy_size: AtomicU64,
    discard_source: bool,
    write_flags: Mutex<WriteFlags>,
    inner: Mutex<Inner>,
    progress_cb: Mutex<Option<Box<dyn ProgressSink>>>,
    in_flight_counter: InFlightCounter,
}

impl BlockCopyState {
    /// `cluster_size = max(min_cluster_size, target_natural_granularity,
    /// SECTOR_SIZE)`, rounded up to a power of two (spec.md §4.C). If
    /// `bitmap` is given, `copy_bitmap` starts as that bitmap's bits
    /// OR-merged into an all-zero bitmap; otherwise it starts all-ones.
    pub fn new(
        source: Arc<dyn BlockNode>,
        target: Arc<dyn BlockNode>,
        bitmap: Option<&DirtyBitmap>,
        discard_source: bool,
        min_cluster_size: u64,
    ) -> Result<Arc<Self>> {
        let size = source.size();
        let cluster_size = round_up_pow2(
            min_cluster_size
                .max(target.natural_granularity())
                .max(SECTOR_SIZE),
        );

        let copy_bitmap = match bitmap {
            Some(src) => {
                let mut bm = DirtyBitmap::new(size, cluster_size)?;
                src.merge_into(&mut bm)?;
                bm
            }
            None => DirtyBitmap::new_all_ones(size, cluster_size)?,
        };

        Ok(Arc::new(BlockCopyState {
            source,
            target,
            cluster_size,
            copy_size: AtomicU64::new(cluster_size.min(MAX_COPY_SIZE)),
            discard_source,
            write_flags: Mutex::new(WriteFlags::empty()),
            inner: Mutex::new(Inner {
                copy_bitmap,
                in_flight: RequestList::new(),
                skip_unallocated: false,
            }),
            progress_cb: Mutex::new(None),
            in_flight_counter: InFlightCounter::new(),
        }))
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn total_size(&self) -> u64 {
        self.source.size()
    }

    pub fn set_write_flags(&self, flags: WriteFlags) {
        *self.write_flags.lock() = flags;
    }

    pub fn write_flags(&self) -> WriteFlags {
        *self.write_flags.lock()
    }

    pub fn set_progress_callback(&self, sink: impl ProgressSink + 'static) {
        *self.progress_cb.lock() = Some(Box::new(sink));
    }

    pub fn set_skip_unallocated(&self, v: bool) {
        self.inner.lock().skip_unallocated = v;
    }

    /// Test-only override of the per-iteration extent cap (SPEC_FULL.md §10.1).
    pub fn set_copy_size_for_test(&self, size: u64) {
        self.copy_size.store(size, Ordering::Relaxed);
    }

    /// Count of bits still set in `copy_bitmap`, in clusters.
    pub fn dirty_cluster_count(&self) -> u64 {
        self.inner.lock().copy_bitmap.dirty_bytes() / self.cluster_size
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.inner.lock().copy_bitmap.dirty_bytes()
    }

    /// Returns the offset of the next dirty cluster at or after `from`, if
    /// any. Used by the backup job's main loop to walk `copy_bitmap` in
    /// ascending order (spec.md §4.E step 3.a).
    pub fn next_dirty_cluster(&self, from: u64) -> Option<u64> {
        let guard = self.inner.lock();
        guard.copy_bitmap.next_dirty(from, guard.copy_bitmap.size_bytes())
    }

    /// A point-in-time clone of `copy_bitmap`, used by the backup job's
    /// `bitmap-mode=always` failure path to OR the still-dirty clusters back
    /// into the user-visible bitmap (spec.md §4.E step 4, §7).
    pub fn bitmap_snapshot(&self) -> DirtyBitmap {
        self.inner.lock().copy_bitmap.clone()
    }

    /// Re-dirties the whole address range; used by `backup_do_checkpoint`
    /// under `sync=none` (spec.md §4.E "Checkpoint operation").
    pub fn mark_all_dirty(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let size = guard.copy_bitmap.size_bytes();
        guard.copy_bitmap.set(0, size)
    }

    /// Applies `f` to a snapshot-safe read-only view of the bitmap's
    /// dirtiness at `off`; used by callers that only need a single bit.
    pub fn is_cluster_dirty(&self, off: u64) -> bool {
        self.inner.lock().copy_bitmap.get(off)
    }

    /// Clears `copy_bitmap` on `[off, len)` unconditionally (spec.md §4.C).
    /// Callers must ensure this is semantically safe — e.g. the CBW filter
    /// only calls this after it has itself taken over responsibility for the
    /// range (snapshot-side discard, spec.md §7).
    pub fn reset(&self, off: u64, len: u64) -> Result<()> {
        self.inner.lock().copy_bitmap.reset(off, len)
    }

    /// Queries `[off, ..)`'s allocation in `source`; if unallocated, clears
    /// `copy_bitmap` over that extent without touching `target`. The race
    /// with a concurrent guest write that allocates the same range is
    /// resolved per SPEC_FULL.md §10.3: any such write goes through
    /// `copy()` first, which takes an `in_flight_reqs` reservation before
    /// this function's own reservation-free bitmap clear could apply, so the
    /// write either wins the reservation race (and copies for real) or finds
    /// the bit already cleared and is a correct no-op.
    pub fn reset_unallocated(&self, off: u64) -> Result<u64> {
        let limit = self.source.size().saturating_sub(off);
        let (allocated, run) = self.source.block_status(off, limit)?;
        if !allocated {
            self.inner.lock().copy_bitmap.reset(off, run)?;
        }
        Ok(run)
    }

    /// Public alignment helper shared with the CBW filter, which must align
    /// a guest write to the same cluster boundaries before calling `copy`.
    pub fn align_to_cluster(&self, off: u64, bytes: u64) -> (u64, u64) {
        self.align_range(off, bytes)
    }

    fn align_range(&self, off: u64, bytes: u64) -> (u64, u64) {
        let c = self.cluster_size;
        let start = (off / c) * c;
        let end = ((off + bytes).div_ceil(c)) * c;
        (start, end)
    }

    /// Performs the copy, blocking the calling thread. If `timeout` is
    /// given and elapses first, the work continues on a background thread
    /// and this call returns `Error::Timeout`; the in-flight counter is not
    /// decremented until that background thread finishes, so `drain()`
    /// still waits for it (spec.md §4.C step 3, §5).
    pub fn copy(
        self: &Arc<Self>,
        off: u64,
        bytes: u64,
        is_write_notifier: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.in_flight_counter.inc();
        let engine = self.clone();
        let worker = move || {
            let res = engine.copy_aligned(off, bytes, is_write_notifier);
            engine.in_flight_counter.dec();
            res
        };

        match timeout {
            None => worker(),
            Some(dur) => {
                let (tx, rx) = std::sync::mpsc::channel();
                std::thread::spawn(move || {
                    let _ = tx.send(worker());
                });
                match rx.recv_timeout(dur) {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(timeout_ms = dur.as_millis() as u64, "block copy exceeded timeout");
                        Err(Error::Timeout)
                    }
                }
            }
        }
    }

    /// Blocks until every in-flight copy (including ones that timed out
    /// from their caller's perspective) has completed.
    pub fn drain(&self) {
        self.in_flight_counter.drain();
    }

    fn copy_aligned(&self, off: u64, bytes: u64, is_write_notifier: bool) -> Result<()> {
        let (start, end) = self.align_range(off, bytes);
        let mut cursor = start;

        while cursor < end {
            let mut guard = self.inner.lock();
            let run = guard.copy_bitmap.next_dirty_area(cursor, end);
            let (a, b) = match run {
                Some((a, b)) => (a, a + b),
                None => break,
            };

            if let Some(conflict) = guard.in_flight.find_conflict(a, b - a) {
                // A prior in-flight copy may clear bits we'd otherwise
                // re-copy; restart the scan from `cursor` after it drains.
                wait_on_req(&conflict, &mut guard);
                drop(guard);
                continue;
            }

            let req = guard.in_flight.insert(a, b - a);
            let skip_unallocated = guard.skip_unallocated;
            drop(guard);

            if skip_unallocated {
                let limit = (b - a).max(1);
                let (allocated, run_len) = self.source.block_status(a, limit)?;
                if !allocated {
                    let cleared = run_len.min(b - a);
                    let mut guard = self.inner.lock();
                    guard.copy_bitmap.reset(a, cleared)?;
                    guard.in_flight.remove(&req);
                    drop(guard);
                    self.report_progress(cleared);
                    cursor = a + cleared;
                    continue;
                }
            }

            let mut b = b;
            let copy_size = self.copy_size.load(Ordering::Relaxed);
            if b - a > copy_size {
                let capped = a + copy_size;
                let mut guard = self.inner.lock();
                guard.in_flight.shrink(&req, copy_size);
                drop(guard);
                b = capped;
            }

            let len = (b - a) as usize;
            let mut buf = vec![0u8; len];
            if let Err(e) = self.source.preadv(a, &mut buf) {
                let mut guard = self.inner.lock();
                guard.in_flight.remove(&req);
                drop(guard);
                return Err(e);
            }

            let flags = self.write_flags();
            if let Err(e) = self.target.pwritev(a, &buf, flags) {
                let mut guard = self.inner.lock();
                guard.in_flight.remove(&req);
                drop(guard);
                // Bits stay set: a retry will re-copy this extent.
                return Err(e);
            }

            self.report_progress(b - a);

            {
                let mut guard = self.inner.lock();
                guard.copy_bitmap.reset(a, b - a)?;
                guard.in_flight.remove(&req);
            }

            if self.discard_source {
                if let Err(e) = self.source.pdiscard(a, b - a) {
                    debug!(error = %e, "best-effort source discard after copy failed");
                }
            }

            trace!(offset = a, bytes = b - a, write_notifier = is_write_notifier, "copied extent");
            cursor = b;
        }

        Ok(())
    }

    fn report_progress(&self, bytes: u64) {
        if let Some(sink) = self.progress_cb.lock().as_mut() {
            sink.on_progress(bytes);
        }
    }
}

//! Block node backends (SPEC_FULL.md §13): the opaque `source`/`target`
//! children the rest of this crate copies bytes between.
//!
//! `MemNode` is the in-memory harness used by the unit and scenario tests;
//! `FileNode` is the real backend, grounded in `DiskProperties`
//! (`devices/src/virtio/block/device.rs` in the teacher repo) but trimmed to
//! plain positioned reads/writes — the teacher's macOS `mach2` mmap path has
//! no counterpart here.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use bitflags::bitflags;

use crate::error::{Error, IoSide, Result};

bitflags! {
    /// Flags attached to a single write, per spec.md §3 (`write_flags`) and
    /// §4.D (`WriteUnchanged` on the guest write path).
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct WriteFlags: u32 {
        /// Force-unit-access: the write must be durable before completing.
        const FUA = 1 << 0;
        /// Target writes from the same backup job must not be reordered
        /// with respect to each other.
        const SERIALISING = 1 << 1;
        /// Target accepts/produces a compressed representation of the data.
        const COMPRESSED = 1 << 2;
        /// The new contents are identical to the old ones; the CBW filter
        /// short-circuits copy-before-write for such guest writes.
        const WRITE_UNCHANGED = 1 << 3;
    }
}

/// Abstract block node: the subset of block-driver operations the copy
/// engine and CBW filter need (spec.md §4.C, §4.D).
pub trait BlockNode: Send + Sync {
    fn size(&self) -> u64;

    /// Smallest unit the backend can usefully align I/O to; feeds
    /// `cluster_size` derivation in `BlockCopyState::new` (spec.md §4.C).
    fn natural_granularity(&self) -> u64 {
        512
    }

    fn preadv(&self, off: u64, buf: &mut [u8]) -> Result<()>;
    fn pwritev(&self, off: u64, buf: &[u8], flags: WriteFlags) -> Result<()>;
    fn pwrite_zeroes(&self, off: u64, len: u64, flags: WriteFlags) -> Result<()>;
    fn pdiscard(&self, off: u64, len: u64) -> Result<()>;
    fn flush(&self) -> Result<()>;

    /// Returns `(allocated, run_len)`: whether `off` is allocated, and how
    /// far that allocation state runs starting at `off` (capped to `limit`
    /// bytes from `off`). Used by `reset_unallocated` and `sync=top`.
    fn block_status(&self, off: u64, limit: u64) -> Result<(bool, u64)>;

    /// Whether this node's driver can accept compressed writes
    /// (spec.md §4.E: `compress` is rejected at job-creation time if not).
    fn supports_compression(&self) -> bool {
        false
    }
}

/// In-memory `BlockNode`, used by unit tests and `tests/scenarios.rs`.
/// Tracks allocation at `alloc_granularity` so `sync=top`/`skip_unallocated`
/// behavior is exercisable without a real filesystem.
pub struct MemNode {
    inner: Mutex<MemNodeInner>,
    alloc_granularity: u64,
}

struct MemNodeInner {
    data: Vec<u8>,
    allocated: Vec<bool>,
    fail_write_ranges: Vec<(u64, u64)>,
    fail_read_ranges: Vec<(u64, u64)>,
}

impl MemNode {
    pub fn new(size: u64, alloc_granularity: u64) -> Self {
        let nclusters = size.div_ceil(alloc_granularity) as usize;
        MemNode {
            inner: Mutex::new(MemNodeInner {
                data: vec![0u8; size as usize],
                allocated: vec![false; nclusters],
                fail_write_ranges: Vec::new(),
                fail_read_ranges: Vec::new(),
            }),
            alloc_granularity,
        }
    }

    /// Fills the whole node with `byte` and marks every cluster allocated —
    /// the harness equivalent of a pre-filled guest disk (scenario S1/S2).
    pub fn fill(&self, byte: u8) {
        let mut inner = self.inner.lock().unwrap();
        inner.data.iter_mut().for_each(|b| *b = byte);
        inner.allocated.iter_mut().for_each(|a| *a = true);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().data.clone()
    }

    /// Injects a one-shot failure for writes overlapping `[off, off+len)`;
    /// used by scenarios S3/S5 to force an `IoWrite`/`EnoSpc` error.
    pub fn inject_write_failure(&self, off: u64, len: u64) {
        self.inner.lock().unwrap().fail_write_ranges.push((off, len));
    }

    pub fn inject_read_failure(&self, off: u64, len: u64) {
        self.inner.lock().unwrap().fail_read_ranges.push((off, len));
    }
}

fn overlaps(a_off: u64, a_len: u64, b_off: u64, b_len: u64) -> bool {
    a_off < b_off + b_len && b_off < a_off + a_len
}

impl BlockNode for MemNode {
    fn size(&self) -> u64 {
        self.inner.lock().unwrap().data.len() as u64
    }

    fn natural_granularity(&self) -> u64 {
        self.alloc_granularity
    }

    fn preadv(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner
            .fail_read_ranges
            .iter()
            .position(|&(o, l)| overlaps(o, l, off, buf.len() as u64))
        {
            inner.fail_read_ranges.remove(pos);
            return Err(Error::from_io(
                IoSide::Read,
                std::io::Error::new(std::io::ErrorKind::Other, "injected read failure"),
            ));
        }
        let start = off as usize;
        buf.copy_from_slice(&inner.data[start..start + buf.len()]);
        Ok(())
    }

    fn pwritev(&self, off: u64, buf: &[u8], _flags: WriteFlags) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner
            .fail_write_ranges
            .iter()
            .position(|&(o, l)| overlaps(o, l, off, buf.len() as u64))
        {
            inner.fail_write_ranges.remove(pos);
            return Err(Error::from_io(
                IoSide::Write,
                std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            ));
        }
        let start = off as usize;
        inner.data[start..start + buf.len()].copy_from_slice(buf);
        let gran = self.alloc_granularity;
        let first = off / gran;
        let last = (off + buf.len() as u64 - 1) / gran;
        for c in first..=last {
            inner.allocated[c as usize] = true;
        }
        Ok(())
    }

    fn pwrite_zeroes(&self, off: u64, len: u64, flags: WriteFlags) -> Result<()> {
        let zeros = vec![0u8; len as usize];
        self.pwritev(off, &zeros, flags)
    }

    fn pdiscard(&self, off: u64, len: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let start = off as usize;
        inner.data[start..start + len as usize].iter_mut().for_each(|b| *b = 0);
        let gran = self.alloc_granularity;
        let first = off / gran;
        let last = (off + len - 1) / gran;
        for c in first..=last {
            inner.allocated[c as usize] = false;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn block_status(&self, off: u64, limit: u64) -> Result<(bool, u64)> {
        let inner = self.inner.lock().unwrap();
        let gran = self.alloc_granularity;
        let first = (off / gran) as usize;
        let state = inner.allocated.get(first).copied().unwrap_or(false);
        let mut run = gran - (off % gran);
        let mut idx = first + 1;
        while run < limit && inner.allocated.get(idx).copied() == Some(state) {
            run += gran;
            idx += 1;
        }
        Ok((state, run.min(limit)))
    }
}

/// Real-file-backed `BlockNode`. `fallocate`-based hole punching is used on
/// Linux where available; other platforms fall back to a zero-fill write,
/// matching the degraded path `DiskProperties::punch_hole` takes when
/// `F_PUNCHHOLE` is unsupported by the underlying filesystem.
pub struct FileNode {
    file: File,
    size: u64,
    natural_granularity: u64,
}

impl FileNode {
    pub fn open(path: impl AsRef<Path>, natural_granularity: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::from_io(IoSide::Read, e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::from_io(IoSide::Read, e))?
            .len();
        Ok(FileNode {
            file,
            size,
            natural_granularity,
        })
    }
}

impl BlockNode for FileNode {
    fn size(&self) -> u64 {
        self.size
    }

    fn natural_granularity(&self) -> u64 {
        self.natural_granularity
    }

    fn preadv(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, off)
            .map_err(|e| Error::from_io(IoSide::Read, e))
    }

    fn pwritev(&self, off: u64, buf: &[u8], flags: WriteFlags) -> Result<()> {
        self.file
            .write_all_at(buf, off)
            .map_err(|e| Error::from_io(IoSide::Write, e))?;
        if flags.contains(WriteFlags::FUA) {
            self.file.sync_data().map_err(|e| Error::from_io(IoSide::Write, e))?;
        }
        Ok(())
    }

    fn pwrite_zeroes(&self, off: u64, len: u64, flags: WriteFlags) -> Result<()> {
        if punch_hole(&self.file, off, len).is_ok() {
            return Ok(());
        }
        let zeros = vec![0u8; len as usize];
        self.pwritev(off, &zeros, flags)
    }

    fn pdiscard(&self, off: u64, len: u64) -> Result<()> {
        punch_hole(&self.file, off, len).or_else(|_| {
            let zeros = vec![0u8; len as usize];
            self.pwritev(off, &zeros, WriteFlags::empty())
        })
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::from_io(IoSide::Write, e))
    }

    fn block_status(&self, off: u64, limit: u64) -> Result<(bool, u64)> {
        // Plain files have no sparse-extent query available through
        // `std::fs`; report everything allocated, matching a non-sparse
        // target and making `skip_unallocated` a no-op for this backend.
        let _ = off;
        Ok((true, limit))
    }
}

#[cfg(target_os = "linux")]
fn punch_hole(file: &File, off: u64, len: u64) -> Result<()> {
    use nix::fcntl::{fallocate, FallocateFlags};
    use std::os::unix::io::AsRawFd;

    fallocate(
        file.as_raw_fd(),
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        off as i64,
        len as i64,
    )
    .map_err(|e| Error::from_io(IoSide::Write, std::io::Error::from(e)))
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _off: u64, _len: u64) -> Result<()> {
    Err(Error::Unsupported("hole punching not available on this platform".into()))
}

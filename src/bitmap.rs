//! Dirty bitmap subsystem (spec.md §4.A).
//!
//! The internal bit layout is not specified by the contract we're given; this
//! is a flat `Vec<u64>` word bitmap, following the same word-at-a-time
//! scan/set idiom as the pack's `dirty_memory.rs` (`aero`) and `easy-fs`'s
//! `bitmap.rs`. `granularity` is the bit-to-byte-range ratio; offsets passed
//! to `set`/`reset`/`get` are in bytes and must be aligned to `granularity`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A bitmap's bits are addressed word-at-a-time; 64 bits per word.
const WORD_BITS: u64 = 64;

#[derive(Debug, Clone)]
struct Words(Vec<u64>);

impl Words {
    fn new(nbits: u64) -> Self {
        Words(vec![0u64; nbits.div_ceil(WORD_BITS) as usize])
    }

    fn get(&self, bit: u64) -> bool {
        let word = (bit / WORD_BITS) as usize;
        let off = bit % WORD_BITS;
        self.0.get(word).map_or(false, |w| w & (1 << off) != 0)
    }

    fn set_range(&mut self, first: u64, count: u64, value: bool) {
        for bit in first..first + count {
            let word = (bit / WORD_BITS) as usize;
            let off = bit % WORD_BITS;
            if value {
                self.0[word] |= 1 << off;
            } else {
                self.0[word] &= !(1 << off);
            }
        }
    }

    fn count(&self) -> u64 {
        self.0.iter().map(|w| w.count_ones() as u64).sum()
    }

    fn next(&self, from: u64, nbits: u64, want: bool) -> Option<u64> {
        (from..nbits).find(|&bit| self.get(bit) == want)
    }

    fn or_from(&mut self, other: &Words) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= b;
        }
    }

    fn resize(&mut self, nbits: u64) {
        self.0.resize(nbits.div_ceil(WORD_BITS) as usize, 0);
    }
}

/// A single dirty bitmap: a set of dirty regions over `[0, size_bytes)` at
/// `granularity`-byte resolution, plus the lifecycle flags from spec.md §3.
#[derive(Debug, Clone)]
pub struct DirtyBitmap {
    name: Option<String>,
    size_bytes: u64,
    granularity: u64,
    words: Words,
    pub disabled: bool,
    pub busy: bool,
    pub readonly: bool,
    pub persistent: bool,
    pub inconsistent: bool,
    pub skip_store: bool,
    successor: Option<Box<DirtyBitmap>>,
    active_iterators: u32,
}

impl DirtyBitmap {
    /// Creates a detached, unnamed bitmap. `granularity` must be a power of
    /// two; `size_bytes` need not be granularity-aligned (the last bit covers
    /// the trailing partial range, matching the original's `bdrv_dirty_bitmap`).
    pub fn new(size_bytes: u64, granularity: u64) -> Result<Self> {
        if granularity == 0 || !granularity.is_power_of_two() {
            return Err(Error::BadArgument(format!(
                "granularity {granularity} is not a power of two"
            )));
        }
        let nbits = size_bytes.div_ceil(granularity);
        Ok(DirtyBitmap {
            name: None,
            size_bytes,
            granularity,
            words: Words::new(nbits),
            disabled: false,
            busy: false,
            readonly: false,
            persistent: false,
            inconsistent: false,
            skip_store: false,
            successor: None,
            active_iterators: 0,
        })
    }

    /// All-ones bitmap, used to seed `copy_bitmap` for `sync=full`/`top`/`none`
    /// and for a fresh block-copy engine with no initial bitmap (spec.md §4.C).
    pub fn new_all_ones(size_bytes: u64, granularity: u64) -> Result<Self> {
        let mut bm = Self::new(size_bytes, granularity)?;
        bm.set(0, size_bytes)?;
        Ok(bm)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    fn nbits(&self) -> u64 {
        self.size_bytes.div_ceil(self.granularity)
    }

    fn check_align(&self, off: u64, len: u64) -> Result<(u64, u64)> {
        if off % self.granularity != 0 || len % self.granularity != 0 {
            return Err(Error::BadArgument(format!(
                "[{off}, {len}) is not aligned to granularity {}",
                self.granularity
            )));
        }
        Ok((off / self.granularity, len / self.granularity))
    }

    pub fn set(&mut self, off: u64, len: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let (first, count) = self.check_align(off, len)?;
        self.words.set_range(first, count, true);
        Ok(())
    }

    pub fn reset(&mut self, off: u64, len: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let (first, count) = self.check_align(off, len)?;
        self.words.set_range(first, count, false);
        Ok(())
    }

    /// Implicit set-on-write path from the block layer; a no-op if the
    /// bitmap is `disabled` (spec.md §3).
    pub fn set_on_write(&mut self, off: u64, len: u64) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        self.set(off, len)
    }

    pub fn get(&self, off: u64) -> bool {
        self.words.get(off / self.granularity)
    }

    /// Total dirty span in bytes, not bits — `words.count()` gives the bit
    /// population, scaled here by `granularity` since every caller wants a
    /// byte count (remaining-bytes accounting, cluster-count division).
    pub fn dirty_bytes(&self) -> u64 {
        self.words.count() * self.granularity
    }

    pub fn next_dirty(&self, off: u64, limit: u64) -> Option<u64> {
        let limit_bit = self.nbits().min(limit.div_ceil(self.granularity));
        let bit = self.words.next(off / self.granularity, limit_bit, true)?;
        Some(bit * self.granularity)
    }

    pub fn next_zero(&self, off: u64, limit: u64) -> Option<u64> {
        let limit_bit = self.nbits().min(limit.div_ceil(self.granularity));
        let bit = self.words.next(off / self.granularity, limit_bit, false)?;
        Some(bit * self.granularity)
    }

    /// Returns `(start, len)` of the maximal dirty run starting at or after
    /// `off`, not exceeding `limit`, or `None` if there is none.
    pub fn next_dirty_area(&self, off: u64, limit: u64) -> Option<(u64, u64)> {
        let start = self.next_dirty(off, limit)?;
        let end = self.next_zero(start, limit).unwrap_or(limit);
        Some((start, end - start))
    }

    /// Whether `[off, len)` is entirely clear (used by the CBW filter to
    /// decide if a snapshot read can be fully served from `target`).
    pub fn is_clear(&self, off: u64, len: u64) -> bool {
        self.next_dirty(off, off + len).is_none()
    }

    /// Whether `[off, len)` is entirely set — used by the CBW filter's
    /// `access_bitmap` check (every cluster in range must be readable).
    pub fn is_fully_set(&self, off: u64, len: u64) -> bool {
        self.next_zero(off, off + len).is_none()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn has_successor(&self) -> bool {
        self.successor.is_some()
    }

    pub fn active_iterators(&self) -> u32 {
        self.active_iterators
    }

    pub fn begin_iterator(&mut self) {
        self.active_iterators += 1;
    }

    pub fn end_iterator(&mut self) {
        self.active_iterators = self.active_iterators.saturating_sub(1);
    }

    fn check_releasable(&self) -> Result<()> {
        if self.active_iterators > 0 {
            return Err(Error::Busy("bitmap has active iterators".into()));
        }
        if self.successor.is_some() {
            return Err(Error::Busy("bitmap has an outstanding successor".into()));
        }
        Ok(())
    }

    /// Creates an anonymous child that receives all future dirty bits while
    /// `self` is frozen (spec.md §4.A). The parent's previous `disabled`
    /// value is inherited by the child.
    pub fn create_successor(&mut self) -> Result<()> {
        if self.busy {
            return Err(Error::Busy("bitmap is already busy".into()));
        }
        if self.successor.is_some() {
            return Err(Error::Busy("bitmap already has a successor".into()));
        }
        let mut child = DirtyBitmap::new(self.size_bytes, self.granularity)?;
        child.disabled = self.disabled;
        self.disabled = true;
        self.busy = true;
        self.successor = Some(Box::new(child));
        Ok(())
    }

    /// Hands the name/persistence to the successor and returns it as the new
    /// owner; `self` is left nameless and releasable by the caller.
    pub fn abdicate(&mut self) -> Result<DirtyBitmap> {
        let mut child = *self
            .successor
            .take()
            .ok_or_else(|| Error::BadArgument("bitmap has no successor".into()))?;
        child.name = self.name.take();
        child.persistent = self.persistent;
        self.persistent = false;
        self.busy = false;
        self.check_releasable()?;
        Ok(child)
    }

    /// Merges the successor back into `self` (logical OR) and drops it,
    /// restoring `self` as the live bitmap with the successor's `disabled`
    /// value (spec.md §4.A).
    pub fn reclaim(&mut self) -> Result<()> {
        let child = self
            .successor
            .take()
            .ok_or_else(|| Error::BadArgument("bitmap has no successor".into()))?;
        self.words.or_from(&child.words);
        self.disabled = child.disabled;
        self.busy = false;
        Ok(())
    }

    /// OR-merges `self`'s current bits into `other`; used by the backup job's
    /// `bitmap-mode=always` failure path to re-expose still-dirty clusters
    /// (spec.md §4.E, §7).
    pub fn merge_into(&self, other: &mut DirtyBitmap) -> Result<()> {
        if self.size_bytes != other.size_bytes {
            return Err(Error::BadArgument("bitmap size mismatch".into()));
        }
        if other.readonly {
            return Err(Error::ReadOnly);
        }
        if self.inconsistent || other.inconsistent {
            return Err(Error::Inconsistent);
        }
        other.words.or_from(&self.words);
        Ok(())
    }

    /// Resizes the bitmap's backing storage, preserving existing bits.
    /// Requires the bitmap to be free of a successor/iterators/busy state.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.check_releasable()?;
        if self.busy {
            return Err(Error::Busy("bitmap is busy".into()));
        }
        let new_nbits = new_size.div_ceil(self.granularity);
        self.words.resize(new_nbits);
        self.size_bytes = new_size;
        Ok(())
    }

    /// Wire-format chunk coverage in bytes, per spec.md §6.
    pub fn serialization_coverage(granularity: u64, chunk_words: u64) -> u64 {
        granularity * chunk_words * 8
    }

    pub fn serialization_align() -> u64 {
        WORD_BITS
    }

    pub fn serialization_size(&self, off: u64, bytes: u64) -> usize {
        let (first, count) = match self.check_align(off, bytes) {
            Ok(v) => v,
            Err(_) => return 0,
        };
        let _ = first;
        count.div_ceil(WORD_BITS) as usize * 8
    }

    /// Serializes the bits covering `[off, bytes)` to a flat byte chunk.
    /// `off`/`bytes` must be aligned to `serialization_align() * granularity`.
    pub fn serialize_part(&self, off: u64, bytes: u64) -> Result<Vec<u8>> {
        let (first_bit, nbits) = self.check_align(off, bytes)?;
        if first_bit % WORD_BITS != 0 {
            return Err(Error::BadArgument(
                "serialize_part offset must be word-aligned".into(),
            ));
        }
        let first_word = (first_bit / WORD_BITS) as usize;
        let nwords = nbits.div_ceil(WORD_BITS) as usize;
        let mut out = Vec::with_capacity(nwords * 8);
        for w in 0..nwords {
            let word = self.words.0.get(first_word + w).copied().unwrap_or(0);
            out.extend_from_slice(&word.to_le_bytes());
        }
        Ok(out)
    }

    /// Inverse of `serialize_part`: ORs the decoded chunk into `[off, bytes)`.
    pub fn deserialize_part(&mut self, off: u64, bytes: u64, chunk: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        let (first_bit, nbits) = self.check_align(off, bytes)?;
        if first_bit % WORD_BITS != 0 {
            return Err(Error::BadArgument(
                "deserialize_part offset must be word-aligned".into(),
            ));
        }
        let first_word = (first_bit / WORD_BITS) as usize;
        let nwords = nbits.div_ceil(WORD_BITS) as usize;
        for w in 0..nwords {
            let bytes8: [u8; 8] = chunk
                .get(w * 8..w * 8 + 8)
                .ok_or_else(|| Error::BadArgument("chunk too short".into()))?
                .try_into()
                .unwrap();
            self.words.0[first_word + w] |= u64::from_le_bytes(bytes8);
        }
        Ok(())
    }
}

/// Shared handle to a dirty bitmap, shared between (e.g.) a backup job and the
/// node-level table it was looked up from.
pub type BitmapHandle = Arc<Mutex<DirtyBitmap>>;

/// Per-node set of named dirty bitmaps, behind a single mutex (spec.md §5:
/// "dirty bitmaps attached to a node are protected by a per-node mutex").
#[derive(Default)]
pub struct BitmapTable {
    inner: Mutex<HashMap<String, BitmapHandle>>,
}

const MAX_BITMAP_NAME_LEN: usize = 255;

impl BitmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, name: &str, size_bytes: u64, granularity: u64) -> Result<BitmapHandle> {
        if name.len() > MAX_BITMAP_NAME_LEN {
            return Err(Error::BadArgument("bitmap name too long".into()));
        }
        let mut table = self.inner.lock();
        if table.contains_key(name) {
            return Err(Error::BadArgument(format!("bitmap '{name}' already exists")));
        }
        let mut bm = DirtyBitmap::new(size_bytes, granularity)?;
        bm.name = Some(name.to_string());
        let handle = Arc::new(Mutex::new(bm));
        table.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn lookup(&self, name: &str) -> Result<BitmapHandle> {
        self.inner
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no bitmap named '{name}'")))
    }

    pub fn remove(&self, name: &str) {
        self.inner.lock().remove(name);
    }

    /// Resizes every bitmap on the node; fails if any bitmap is busy, has a
    /// successor, or has active iterators (spec.md §4.A).
    pub fn truncate_all(&self, new_size: u64) -> Result<()> {
        let table = self.inner.lock();
        for handle in table.values() {
            handle.lock().truncate(new_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reset_and_count_roundtrip() {
        let mut bm = DirtyBitmap::new(1 << 20, 64 << 10).unwrap();
        assert_eq!(bm.dirty_bytes(), 0);
        bm.set(0, 128 << 10).unwrap();
        assert_eq!(bm.dirty_bytes(), 128 << 10);
        bm.reset(0, 64 << 10).unwrap();
        assert_eq!(bm.dirty_bytes(), 64 << 10);
        assert!(!bm.get(0));
        assert!(bm.get(64 << 10));
    }

    #[test]
    fn misaligned_access_is_rejected() {
        let mut bm = DirtyBitmap::new(1 << 20, 64 << 10).unwrap();
        assert!(bm.set(1, 64 << 10).is_err());
    }

    #[test]
    fn readonly_rejects_mutation() {
        let mut bm = DirtyBitmap::new(1 << 20, 64 << 10).unwrap();
        bm.readonly = true;
        assert!(matches!(bm.set(0, 64 << 10), Err(Error::ReadOnly)));
    }

    #[test]
    fn successor_lifecycle_freezes_parent() {
        let mut parent = DirtyBitmap::new(1 << 20, 64 << 10).unwrap();
        parent.set(0, 64 << 10).unwrap();
        parent.create_successor().unwrap();
        assert!(parent.busy);
        assert!(parent.disabled);
        assert!(parent.create_successor().is_err());
    }

    #[test]
    fn reclaim_is_bit_identical_to_no_successor() {
        // reclaim(create_successor(x)) == x, spec.md §8 property 7.
        let mut x = DirtyBitmap::new(1 << 20, 64 << 10).unwrap();
        x.set(0, 3 * (64 << 10)).unwrap();
        let before = x.serialize_part(0, x.size_bytes()).unwrap();

        x.create_successor().unwrap();
        x.reclaim().unwrap();

        let after = x.serialize_part(0, x.size_bytes()).unwrap();
        assert_eq!(before, after);
        assert!(!x.busy);
        assert!(!x.has_successor());
    }

    #[test]
    fn merge_laws_are_associative_over_union() {
        // merge(a, b); merge(a, c) == merge(a, b u c), spec.md §8 property 7.
        let gran = 64 << 10;
        let size = 1 << 20;
        let mut a1 = DirtyBitmap::new(size, gran).unwrap();
        let mut a2 = a1.clone();

        let mut b = DirtyBitmap::new(size, gran).unwrap();
        b.set(0, gran).unwrap();
        let mut c = DirtyBitmap::new(size, gran).unwrap();
        c.set(gran, gran).unwrap();

        b.merge_into(&mut a1).unwrap();
        c.merge_into(&mut a1).unwrap();

        let mut bc = b.clone();
        c.merge_into(&mut bc).unwrap();
        bc.merge_into(&mut a2).unwrap();

        assert_eq!(
            a1.serialize_part(0, size).unwrap(),
            a2.serialize_part(0, size).unwrap()
        );
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let gran = 64 << 10;
        let size = 4u64 << 20;
        let mut bm = DirtyBitmap::new(size, gran).unwrap();
        bm.set(0, gran).unwrap();
        bm.set(10 * gran, gran).unwrap();

        let chunk = bm.serialize_part(0, size).unwrap();
        let mut fresh = DirtyBitmap::new(size, gran).unwrap();
        fresh.deserialize_part(0, size, &chunk).unwrap();

        assert_eq!(fresh.dirty_bytes(), bm.dirty_bytes());
        assert!(fresh.get(0));
        assert!(fresh.get(10 * gran));
    }

    #[test]
    fn table_truncate_requires_idle_bitmaps() {
        let table = BitmapTable::new();
        let h = table.create("b1", 1 << 20, 64 << 10).unwrap();
        h.lock().create_successor().unwrap();
        assert!(table.truncate_all(2 << 20).is_err());
    }
}

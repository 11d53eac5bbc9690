//! Trunks: node-local slabs of managed memory subdivided into segments.
//!
//! A trunk owns one contiguous memory region, the per-cell location index,
//! the striped cell locks, and the dirty-range map the durability writer
//! drains. All addresses are byte offsets into the trunk's region.

pub mod cells;
pub mod defrag;
pub mod memory;
pub mod ranges;
pub mod segment;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crossbeam_skiplist::SkipMap;

use crate::cell::{CellHeader, CellType, CELL_HEADER_SIZE};
use crate::errdata;
use crate::error::{Error, Result};
use crate::schema::SchemaTable;
use memory::TrunkMemory;
use ranges::RangeMap;
use segment::{Segment, SegmentStats, SEGMENT_SIZE};

/// Stripe count for the per-cell lock table.
pub const LOCK_STRIPES: usize = 256;

pub struct Trunk {
    pub id: u32,
    memory: TrunkMemory,
    segments: Vec<Segment>,
    /// hash -> current address. The authoritative pointer; updates are the
    /// linearization point for relocation.
    index: SkipMap<u64, AtomicUsize>,
    /// Striped per-cell locks, keyed by hash. Mutators take the write side,
    /// readers the read side; the defragmenter takes neither.
    cell_locks: Vec<RwLock<()>>,
    dirty: Mutex<RangeMap>,
    durability: bool,
    schemas: Arc<SchemaTable>,
    version_counter: AtomicU64,
}

/// A reserved region in a segment. The embedded read guard keeps the
/// defragmenter out of the segment while the caller writes the region.
pub struct Allocation<'a> {
    trunk: &'a Trunk,
    pub seg: &'a Segment,
    pub addr: usize,
    len: usize,
    _guard: RwLockReadGuard<'a, ()>,
}

impl Allocation<'_> {
    /// Returns the reserved region to the segment's fragment set, for write
    /// paths that abort after reserving. Stamps a tombstone over the region
    /// first so segment walks stay framed; reserved regions always fit a
    /// header.
    pub fn rollback(self) -> Result<()> {
        if self.len >= CELL_HEADER_SIZE {
            let header = CellHeader {
                hash: 0,
                partition: 0,
                schema_id: 0,
                cell_length: (self.len - CELL_HEADER_SIZE) as u32,
                cell_type: CellType::Tombstone,
                version: 0,
            };
            unsafe { self.trunk.memory.slice_mut(self.addr, CELL_HEADER_SIZE) }
                .copy_from_slice(&header.encode());
            self.trunk.mark_dirty(self.addr, self.addr + CELL_HEADER_SIZE)?;
        }
        self.seg.retire_region(self.addr, self.addr + self.len)
    }
}

#[derive(Clone, Debug)]
pub struct TrunkStats {
    pub id: u32,
    pub cell_count: usize,
    pub segments: Vec<SegmentStats>,
}

impl Trunk {
    /// Creates a trunk of `size` bytes, carved into `size / SEGMENT_SIZE`
    /// segments.
    pub fn new(id: u32, size: usize, schemas: Arc<SchemaTable>, durability: bool) -> Result<Trunk> {
        let seg_count = size / SEGMENT_SIZE;
        if seg_count == 0 {
            return Err(errdata!(
                "trunk size {size} is smaller than a segment ({SEGMENT_SIZE})"
            ));
        }
        let segments = (0..seg_count)
            .map(|i| Segment::new(i as u32, i * SEGMENT_SIZE, SEGMENT_SIZE))
            .collect();
        Ok(Trunk {
            id,
            memory: TrunkMemory::zeroed(seg_count * SEGMENT_SIZE),
            segments,
            index: SkipMap::new(),
            cell_locks: (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
            dirty: Mutex::new(RangeMap::new()),
            durability,
            schemas,
            version_counter: AtomicU64::new(0),
        })
    }

    pub fn schemas(&self) -> &SchemaTable {
        &self.schemas
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub(crate) fn memory(&self) -> &TrunkMemory {
        &self.memory
    }

    pub fn segment_for(&self, addr: usize) -> &Segment {
        &self.segments[addr / SEGMENT_SIZE]
    }

    pub fn cell_lock(&self, hash: u64) -> &RwLock<()> {
        &self.cell_locks[hash as usize % LOCK_STRIPES]
    }

    /// The current address of a hash, if indexed.
    pub fn locate(&self, hash: u64) -> Option<usize> {
        self.index
            .get(&hash)
            .map(|entry| entry.value().load(Ordering::SeqCst))
    }

    pub fn contains_hash(&self, hash: u64) -> bool {
        self.index.contains_key(&hash)
    }

    pub fn cell_count(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn index_insert(&self, hash: u64, addr: usize) {
        self.index.insert(hash, AtomicUsize::new(addr));
    }

    pub(crate) fn index_store(&self, hash: u64, addr: usize) {
        match self.index.get(&hash) {
            Some(entry) => entry.value().store(addr, Ordering::SeqCst),
            None => {
                self.index.insert(hash, AtomicUsize::new(addr));
            }
        }
    }

    pub(crate) fn index_remove(&self, hash: u64) {
        self.index.remove(&hash);
    }

    /// Moves a hash from `old` to `new` iff it still points at `old`. The
    /// defragmenter's linearization point.
    pub(crate) fn index_cas(&self, hash: u64, old: usize, new: usize) -> bool {
        match self.index.get(&hash) {
            Some(entry) => entry
                .value()
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            None => false,
        }
    }

    /// Drops every index entry. Cell bytes and accounting stay behind; used
    /// to simulate a crashed node before recovery.
    pub(crate) fn clear_index(&self) {
        while let Some(entry) = self.index.front() {
            entry.remove();
        }
    }

    pub fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Keeps the version counter ahead of versions installed from raw bytes.
    pub fn observe_version(&self, version: u64) {
        self.version_counter.fetch_max(version, Ordering::SeqCst);
    }

    /// Reserves `len` bytes in the first segment that can hold them. When no
    /// segment can, compacts the trunk once and retries before giving up
    /// with `StoreFull`.
    pub fn try_acquire_space(&self, len: usize) -> Result<Allocation<'_>> {
        for pass in 0..2 {
            for seg in &self.segments {
                let guard = seg.read()?;
                if let Some(addr) = seg.try_acquire(len) {
                    return Ok(Allocation {
                        trunk: self,
                        seg,
                        addr,
                        len,
                        _guard: guard,
                    });
                }
            }
            if pass == 0 {
                // Reclaim anything reclaimable before failing the write.
                defrag::compact_trunk(self, 1.0);
            }
        }
        Err(Error::StoreFull)
    }

    /// Records `[lo, hi)` as dirty when durability is on.
    pub fn mark_dirty(&self, lo: usize, hi: usize) -> Result<()> {
        if self.durability {
            self.dirty.lock()?.insert(lo as u64, hi as u64);
        }
        Ok(())
    }

    /// Takes the accumulated dirty ranges, leaving an empty map for ranges
    /// that accrue during the backup cycle.
    pub fn take_dirty(&self) -> Result<BTreeMap<u64, u64>> {
        Ok(self.dirty.lock()?.take_all())
    }

    /// Puts a range back, for bytes past the cycle's snapshot boundary.
    pub fn requeue_dirty(&self, lo: u64, hi: u64) -> Result<()> {
        self.dirty.lock()?.insert(lo, hi);
        Ok(())
    }

    pub fn dirty_range_count(&self) -> Result<usize> {
        Ok(self.dirty.lock()?.len())
    }

    /// Snapshot of a segment's append head relative to its base, the
    /// durability writer's imaging window.
    pub fn append_head_value(&self, seg: &Segment) -> u64 {
        (seg.append_head() - seg.base()) as u64
    }

    pub fn stats(&self) -> Result<TrunkStats> {
        Ok(TrunkStats {
            id: self.id,
            cell_count: self.cell_count(),
            segments: self
                .segments
                .iter()
                .map(Segment::stats)
                .collect::<Result<_>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_trunk() -> Trunk {
        Trunk::new(0, SEGMENT_SIZE, Arc::new(SchemaTable::new()), true).unwrap()
    }

    #[test]
    fn test_new_sizes() {
        assert!(Trunk::new(0, 100, Arc::new(SchemaTable::new()), false).is_err());
        let trunk = Trunk::new(0, 2 * SEGMENT_SIZE + 17, Arc::new(SchemaTable::new()), false)
            .unwrap();
        assert_eq!(trunk.segments().len(), 2);
        assert_eq!(trunk.memory().len(), 2 * SEGMENT_SIZE);
    }

    #[test]
    fn test_acquire_spills_to_next_segment() {
        let trunk = Trunk::new(0, 2 * SEGMENT_SIZE, Arc::new(SchemaTable::new()), false).unwrap();
        let a = trunk.try_acquire_space(SEGMENT_SIZE).unwrap();
        assert_eq!(a.addr, 0);
        drop(a);
        let b = trunk.try_acquire_space(10).unwrap();
        assert_eq!(b.addr, SEGMENT_SIZE);
        drop(b);
    }

    #[test]
    fn test_acquire_store_full() {
        let trunk = test_trunk();
        let a = trunk.try_acquire_space(SEGMENT_SIZE).unwrap();
        drop(a);
        assert_eq!(
            trunk.try_acquire_space(1).err(),
            Some(Error::StoreFull)
        );
    }

    #[test]
    fn test_allocation_rollback_credits_fragment() {
        let trunk = test_trunk();
        let alloc = trunk.try_acquire_space(100).unwrap();
        let seg_id = alloc.seg.id as usize;
        alloc.rollback().unwrap();
        let seg = &trunk.segments()[seg_id];
        assert_eq!(seg.dead_bytes(), 100);
        assert_eq!(seg.fragments().unwrap().len(), 1);
    }

    #[test]
    fn test_index_cas() {
        let trunk = test_trunk();
        trunk.index_insert(7, 100);
        assert!(!trunk.index_cas(7, 50, 200));
        assert!(trunk.index_cas(7, 100, 200));
        assert_eq!(trunk.locate(7), Some(200));
        assert!(!trunk.index_cas(8, 0, 1));
    }

    #[test]
    fn test_dirty_ranges_tracked_only_with_durability() {
        let trunk = test_trunk();
        trunk.mark_dirty(0, 10).unwrap();
        trunk.mark_dirty(10, 20).unwrap();
        assert_eq!(trunk.dirty_range_count().unwrap(), 1);

        let off = Trunk::new(0, SEGMENT_SIZE, Arc::new(SchemaTable::new()), false).unwrap();
        off.mark_dirty(0, 10).unwrap();
        assert_eq!(off.dirty_range_count().unwrap(), 0);
    }

    #[test]
    fn test_versions_monotonic_past_observed() {
        let trunk = test_trunk();
        let v1 = trunk.next_version();
        trunk.observe_version(100);
        let v2 = trunk.next_version();
        assert!(v1 < v2 && v2 > 100);
    }
}

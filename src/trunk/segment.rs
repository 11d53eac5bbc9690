//! Segments: fixed-size sub-regions of a trunk with bump-pointer allocation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;

/// Process-wide segment size.
pub const SEGMENT_SIZE: usize = 8 * 1024 * 1024;

/// Bookkeeping for one fixed-size region of trunk memory.
///
/// The RW lock orders byte access: allocators and in-place mutators are
/// readers (they own disjoint regions), the defragmenter is the only writer.
/// `append_head`, `dead_bytes` and the fragment set are updated with atomics
/// or under the fragment mutex, so mutators on different cells never contend
/// beyond the CAS.
pub struct Segment {
    pub id: u32,
    base: usize,
    bound: usize,
    append_head: AtomicUsize,
    dead_bytes: AtomicUsize,
    /// Dead intervals, `lo -> hi` (half-open). Accounting for space inside
    /// the written region that the index no longer references.
    frags: Mutex<BTreeMap<usize, usize>>,
    lock: RwLock<()>,
    /// Append head (relative to base) as of the last completed backup cycle.
    last_backup_head: AtomicUsize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentStats {
    pub id: u32,
    pub used_bytes: usize,
    pub dead_bytes: usize,
    pub fragment_count: usize,
}

impl Segment {
    pub fn new(id: u32, base: usize, size: usize) -> Segment {
        Segment {
            id,
            base,
            bound: base + size,
            append_head: AtomicUsize::new(base),
            dead_bytes: AtomicUsize::new(0),
            frags: Mutex::new(BTreeMap::new()),
            lock: RwLock::new(()),
            last_backup_head: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn append_head(&self) -> usize {
        self.append_head.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> usize {
        self.append_head() - self.base
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.bound
    }

    /// Reserves `len` bytes, returning the region's start address, or None
    /// when the segment cannot hold it. The caller must hold this segment's
    /// read lock and keep holding it while writing the region.
    pub fn try_acquire(&self, len: usize) -> Option<usize> {
        loop {
            let head = self.append_head.load(Ordering::SeqCst);
            let next = head + len;
            if next > self.bound {
                return None;
            }
            if self
                .append_head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// Records `[lo, hi)` as dead space.
    pub fn add_fragment(&self, lo: usize, hi: usize) -> Result<()> {
        debug_assert!(lo < hi && lo >= self.base && hi <= self.append_head());
        self.frags.lock()?.insert(lo, hi);
        Ok(())
    }

    /// Retires a whole entry region `[lo, hi)`: replaces any fragments
    /// already recorded inside it with the single interval and credits only
    /// the bytes not yet counted dead. Exact regardless of earlier in-place
    /// shrinks, and needs no schema walk.
    pub fn retire_region(&self, lo: usize, hi: usize) -> Result<()> {
        debug_assert!(lo < hi && lo >= self.base && hi <= self.append_head());
        let mut frags = self.frags.lock()?;
        let mut already_dead = 0;
        let contained: Vec<usize> = frags
            .range(lo..hi)
            .map(|(&start, &end)| {
                already_dead += end - start;
                start
            })
            .collect();
        for start in contained {
            frags.remove(&start);
        }
        frags.insert(lo, hi);
        self.dead_bytes
            .fetch_add(hi - lo - already_dead, Ordering::SeqCst);
        Ok(())
    }

    pub fn inc_dead(&self, n: usize) {
        self.dead_bytes.fetch_add(n, Ordering::SeqCst);
    }

    pub fn dead_bytes(&self) -> usize {
        self.dead_bytes.load(Ordering::SeqCst)
    }

    pub fn fragments(&self) -> Result<MutexGuard<'_, BTreeMap<usize, usize>>> {
        Ok(self.frags.lock()?)
    }

    /// `1 - dead / used`; an untouched segment is fully alive.
    pub fn alive_ratio(&self) -> f32 {
        let used = self.used_bytes();
        if used == 0 {
            return 1.0;
        }
        1.0 - self.dead_bytes() as f32 / used as f32
    }

    /// Resets bookkeeping after compaction rewrote the region. The caller
    /// must hold the write lock.
    pub fn reset_after_compaction(&self, new_head: usize) -> Result<()> {
        debug_assert!(new_head >= self.base && new_head <= self.bound);
        self.append_head.store(new_head, Ordering::SeqCst);
        self.dead_bytes.store(0, Ordering::SeqCst);
        self.frags.lock()?.clear();
        Ok(())
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, ()>> {
        Ok(self.lock.read()?)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        Ok(self.lock.write()?)
    }

    pub fn last_backup_head(&self) -> usize {
        self.last_backup_head.load(Ordering::SeqCst)
    }

    pub fn set_last_backup_head(&self, head: usize) {
        self.last_backup_head.store(head, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Result<SegmentStats> {
        Ok(SegmentStats {
            id: self.id,
            used_bytes: self.used_bytes(),
            dead_bytes: self.dead_bytes(),
            fragment_count: self.frags.lock()?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_acquire_bump_and_overflow() {
        let seg = Segment::new(0, 0, 100);
        assert_eq!(seg.try_acquire(60), Some(0));
        assert_eq!(seg.try_acquire(40), Some(60));
        assert_eq!(seg.try_acquire(1), None);
        assert_eq!(seg.append_head(), 100);
        assert_eq!(seg.used_bytes(), 100);
    }

    #[test]
    fn test_exact_fit() {
        let seg = Segment::new(0, 0, 64);
        assert_eq!(seg.try_acquire(64), Some(0));
        assert_eq!(seg.try_acquire(0), Some(64));
    }

    #[test]
    fn test_alive_ratio() {
        let seg = Segment::new(0, 0, 1000);
        assert_eq!(seg.alive_ratio(), 1.0);
        seg.try_acquire(100).unwrap();
        seg.inc_dead(25);
        assert!((seg.alive_ratio() - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_reset_after_compaction() {
        let seg = Segment::new(0, 0, 1000);
        seg.try_acquire(500).unwrap();
        seg.inc_dead(200);
        seg.add_fragment(100, 300).unwrap();
        seg.reset_after_compaction(300).unwrap();
        assert_eq!(seg.append_head(), 300);
        assert_eq!(seg.dead_bytes(), 0);
        assert!(seg.fragments().unwrap().is_empty());
    }

    #[test]
    fn test_retire_region_subtracts_prior_fragments() {
        let seg = Segment::new(0, 0, 1000);
        seg.try_acquire(200).unwrap();
        // A 20-byte shrink fragment inside the entry, already counted dead.
        seg.add_fragment(150, 170).unwrap();
        seg.inc_dead(20);
        seg.retire_region(100, 200).unwrap();
        assert_eq!(seg.dead_bytes(), 100);
        let frags = seg.fragments().unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags.get(&100), Some(&200));
    }

    #[test]
    fn test_concurrent_acquire_disjoint() {
        let seg = Arc::new(Segment::new(0, 0, 1 << 20));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let seg = Arc::clone(&seg);
            handles.push(std::thread::spawn(move || {
                let mut regions = Vec::new();
                for _ in 0..100 {
                    let _g = seg.read().unwrap();
                    regions.push(seg.try_acquire(64).unwrap());
                }
                regions
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        // Disjoint 64-byte regions whose union is the append head advance.
        assert_eq!(all.len(), 800);
        assert_eq!(seg.used_bytes(), 800 * 64);
    }
}

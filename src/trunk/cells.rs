//! Cell operations on a trunk.
//!
//! Every mutator takes the cell's striped write lock, readers the read lock.
//! Byte access additionally goes through the owning segment's read lock, so
//! relocation by the defragmenter is excluded while an operation touches an
//! entry. Addresses loaded before the segment lock is held are re-resolved
//! after: compaction relocates only within a segment, so the segment itself
//! is stable, the offset is not.

use crate::cell::{CellHeader, CellType, CELL_HEADER_SIZE};
use crate::codec::{self, PathSeg};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::trunk::segment::SEGMENT_SIZE;
use crate::trunk::{Allocation, Trunk};
use crate::types::{Value, HASH_KEY, SCHEMA_KEY};

impl Trunk {
    /// Creates a cell. Fails with `AlreadyExists` when the hash is indexed.
    pub fn new_cell(&self, id: Id, schema_id: u32, value: &Value) -> Result<()> {
        let _cell = self.cell_lock(id.hash).write()?;
        if self.contains_hash(id.hash) {
            return Err(Error::AlreadyExists);
        }
        let schema = self.schemas().get(schema_id)?;
        let body = codec::encode_body(self.schemas(), &schema, value)?;
        let total = CELL_HEADER_SIZE + body.len();
        if total > SEGMENT_SIZE {
            return Err(Error::ObjectTooLarge(total));
        }
        let header = CellHeader::new(id, schema_id, body.len() as u32, self.next_version());
        let alloc = self.try_acquire_space(total)?;
        self.write_entry(&alloc, &header, &body);
        self.index_insert(id.hash, alloc.addr);
        self.mark_dirty(alloc.addr, alloc.addr + total)?;
        Ok(())
    }

    /// Decodes the cell into a map, with the reserved `*schema*` and
    /// `*hash*` keys attached.
    pub fn read_cell(&self, hash: u64) -> Result<Value> {
        let _cell = self.cell_lock(hash).read()?;
        self.read_entry_locked(hash, |_, header, body| {
            let schema = self.schemas().get(header.schema_id)?;
            let decoded = codec::decode_body(self.schemas(), &schema, body)?;
            let Value::Map(mut map) = decoded else {
                return Err(Error::InvalidData("cell decoded to a non-map".to_string()));
            };
            map.insert(
                SCHEMA_KEY.to_string(),
                Value::Long(header.schema_id as i64),
            );
            map.insert(HASH_KEY.to_string(), Value::Long(header.hash as i64));
            Ok(Value::Map(map))
        })
    }

    /// Header-only read.
    pub fn head_cell(&self, hash: u64) -> Result<CellHeader> {
        let _cell = self.cell_lock(hash).read()?;
        self.read_entry_locked(hash, |_, header, _| Ok(*header))
    }

    /// Decodes the value at `path`, or None when the path is invalid.
    pub fn get_in_cell(&self, hash: u64, path: &[PathSeg]) -> Result<Option<Value>> {
        let _cell = self.cell_lock(hash).read()?;
        self.read_entry_locked(hash, |_, header, body| {
            let schema = self.schemas().get(header.schema_id)?;
            codec::get_in(self.schemas(), &schema, body, path)
        })
    }

    /// Single-pass partial read of the named top-level fields.
    pub fn select_keys_from_cell(&self, hash: u64, keys: &[&str]) -> Result<Value> {
        let _cell = self.cell_lock(hash).read()?;
        self.read_entry_locked(hash, |_, header, body| {
            let schema = self.schemas().get(header.schema_id)?;
            codec::select_keys(self.schemas(), &schema, body, keys)
        })
    }

    /// Replaces the cell's value. Shrinks rewrite in place; grows relocate
    /// and tombstone the old entry.
    pub fn replace_cell(&self, hash: u64, value: &Value) -> Result<()> {
        let _cell = self.cell_lock(hash).write()?;
        self.replace_locked(hash, value)
    }

    /// Reads the cell, applies `apply` to the decoded map, and replaces the
    /// cell with the result, all under the cell's write lock. Returns the
    /// new value.
    pub fn update_cell(&self, hash: u64, apply: impl FnOnce(Value) -> Result<Value>) -> Result<Value> {
        let _cell = self.cell_lock(hash).write()?;
        let current = self.read_entry_locked(hash, |_, header, body| {
            let schema = self.schemas().get(header.schema_id)?;
            codec::decode_body(self.schemas(), &schema, body)
        })?;
        let updated = apply(current)?;
        self.replace_locked(hash, &updated)?;
        Ok(updated)
    }

    /// Tombstones the cell and drops it from the index. Its bytes are
    /// reclaimed by the next compaction of the segment.
    pub fn delete_cell(&self, hash: u64) -> Result<()> {
        let _cell = self.cell_lock(hash).write()?;
        let located = self.locate(hash).ok_or(Error::NotFound)?;
        let seg = self.segment_for(located);
        let _guard = seg.read()?;
        let addr = self.locate(hash).ok_or(Error::NotFound)?;
        let mut header =
            CellHeader::decode(unsafe { self.memory().slice(addr, CELL_HEADER_SIZE) })?;
        header.cell_type = CellType::Tombstone;
        unsafe { self.memory().slice_mut(addr, CELL_HEADER_SIZE) }
            .copy_from_slice(&header.encode());
        self.index_remove(hash);
        seg.retire_region(addr, addr + header.entry_len())?;
        self.mark_dirty(addr, addr + CELL_HEADER_SIZE)?;
        Ok(())
    }

    /// The recovery path: installs pre-encoded cell bytes unless the index
    /// already holds the hash at an equal-or-newer version. Returns whether
    /// the bytes were installed.
    pub fn new_cell_by_raw_if_newer(&self, id: Id, version: u64, bytes: &[u8]) -> Result<bool> {
        let header = CellHeader::decode(bytes)?;
        if header.cell_type != CellType::Normal {
            return Err(Error::CorruptReplica(
                "raw install of a tombstone".to_string(),
            ));
        }
        if header.hash != id.hash || header.partition != id.partition {
            return Err(Error::CorruptReplica(format!("raw cell id mismatch for {id}")));
        }
        if bytes.len() != header.entry_len() {
            return Err(Error::CorruptReplica(format!(
                "raw cell is {} bytes, header declares {}",
                bytes.len(),
                header.entry_len()
            )));
        }
        if bytes.len() > SEGMENT_SIZE {
            return Err(Error::ObjectTooLarge(bytes.len()));
        }

        let _cell = self.cell_lock(id.hash).write()?;
        if self.contains_hash(id.hash) {
            let (old_version, _) = self.read_entry_locked(id.hash, |addr, h, _| {
                Ok((h.version, addr))
            })?;
            if old_version >= version {
                return Ok(false);
            }
            let alloc = self.try_acquire_space(bytes.len())?;
            let old_addr = self.locate(id.hash).ok_or(Error::NotFound)?;
            self.write_raw(&alloc, bytes);
            self.index_store(id.hash, alloc.addr);
            self.mark_dirty(alloc.addr, alloc.addr + bytes.len())?;
            drop(alloc);
            self.tombstone_residue(old_addr, id.hash, old_version)?;
        } else {
            let alloc = self.try_acquire_space(bytes.len())?;
            self.write_raw(&alloc, bytes);
            self.index_insert(id.hash, alloc.addr);
            self.mark_dirty(alloc.addr, alloc.addr + bytes.len())?;
        }
        self.observe_version(version.max(header.version));
        Ok(true)
    }

    /// Resolves the entry for `hash` under its segment's read lock and hands
    /// `(addr, header, body)` to `read`. The body slice spans the stored
    /// extent; in-place shrinks may leave the logical value shorter.
    fn read_entry_locked<T>(
        &self,
        hash: u64,
        read: impl FnOnce(usize, &CellHeader, &[u8]) -> Result<T>,
    ) -> Result<T> {
        let located = self.locate(hash).ok_or(Error::NotFound)?;
        let seg = self.segment_for(located);
        let _guard = seg.read()?;
        let addr = self.locate(hash).ok_or(Error::NotFound)?;
        let header =
            CellHeader::decode(unsafe { self.memory().slice(addr, CELL_HEADER_SIZE) })?;
        let body = unsafe {
            self.memory()
                .slice(addr + CELL_HEADER_SIZE, header.cell_length as usize)
        };
        read(addr, &header, body)
    }

    fn replace_locked(&self, hash: u64, value: &Value) -> Result<()> {
        let (schema_id, partition, l_old, old_version) =
            self.read_entry_locked(hash, |_, header, body| {
                let schema = self.schemas().get(header.schema_id)?;
                let l_old = codec::body_length(self.schemas(), &schema, body)?;
                Ok((header.schema_id, header.partition, l_old, header.version))
            })?;
        let schema = self.schemas().get(schema_id)?;
        let body = codec::encode_body(self.schemas(), &schema, value)?;
        let l_new = body.len();
        let version = self.next_version();

        if l_new <= l_old {
            // Rewrite in place. The stored extent is left untouched so the
            // entry keeps its framing for segment walks; the shrunk tail is
            // retired into the fragment set.
            let located = self.locate(hash).ok_or(Error::NotFound)?;
            let seg = self.segment_for(located);
            let _guard = seg.read()?;
            let addr = self.locate(hash).ok_or(Error::NotFound)?;
            let mut header =
                CellHeader::decode(unsafe { self.memory().slice(addr, CELL_HEADER_SIZE) })?;
            header.version = version;
            let buf = unsafe {
                self.memory()
                    .slice_mut(addr, CELL_HEADER_SIZE + l_new)
            };
            buf[..CELL_HEADER_SIZE].copy_from_slice(&header.encode());
            buf[CELL_HEADER_SIZE..].copy_from_slice(&body);
            self.mark_dirty(addr, addr + CELL_HEADER_SIZE + l_new)?;
            if l_new < l_old {
                let lo = addr + CELL_HEADER_SIZE + l_new;
                let hi = addr + CELL_HEADER_SIZE + l_old;
                seg.add_fragment(lo, hi)?;
                seg.inc_dead(hi - lo);
            }
            return Ok(());
        }

        // Grow: fresh copy, index repoint, tombstone the old entry.
        let total = CELL_HEADER_SIZE + l_new;
        if total > SEGMENT_SIZE {
            return Err(Error::ObjectTooLarge(total));
        }
        let alloc = self.try_acquire_space(total)?;
        // Acquisition may have compacted the old segment; take the current
        // address before repointing.
        let old_addr = self.locate(hash).ok_or(Error::NotFound)?;
        let header = CellHeader {
            hash,
            partition,
            schema_id,
            cell_length: l_new as u32,
            cell_type: CellType::Normal,
            version,
        };
        self.write_entry(&alloc, &header, &body);
        self.index_store(hash, alloc.addr);
        self.mark_dirty(alloc.addr, alloc.addr + total)?;
        drop(alloc);
        self.tombstone_residue(old_addr, hash, old_version)?;
        Ok(())
    }

    fn write_entry(&self, alloc: &Allocation, header: &CellHeader, body: &[u8]) {
        let buf = unsafe {
            self.memory()
                .slice_mut(alloc.addr, CELL_HEADER_SIZE + body.len())
        };
        buf[..CELL_HEADER_SIZE].copy_from_slice(&header.encode());
        buf[CELL_HEADER_SIZE..].copy_from_slice(body);
    }

    fn write_raw(&self, alloc: &Allocation, bytes: &[u8]) {
        unsafe { self.memory().slice_mut(alloc.addr, bytes.len()) }.copy_from_slice(bytes);
    }

    /// Rewrites the stale entry at `addr` as a tombstone and retires its
    /// region, after verifying it still holds the expected cell. Compaction
    /// may already have reclaimed the region, in which case the residue was
    /// or will be dropped by a segment sweep and there is nothing to retire.
    fn tombstone_residue(&self, addr: usize, hash: u64, version: u64) -> Result<()> {
        let seg = self.segment_for(addr);
        let _guard = seg.read()?;
        let Ok(mut header) =
            CellHeader::decode(unsafe { self.memory().slice(addr, CELL_HEADER_SIZE) })
        else {
            return Ok(());
        };
        if header.hash != hash
            || header.version != version
            || header.cell_type != CellType::Normal
        {
            return Ok(());
        }
        header.cell_type = CellType::Tombstone;
        unsafe { self.memory().slice_mut(addr, CELL_HEADER_SIZE) }
            .copy_from_slice(&header.encode());
        self.mark_dirty(addr, addr + CELL_HEADER_SIZE)?;
        seg.retire_region(addr, addr + header.entry_len())
    }
}

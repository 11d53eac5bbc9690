//! Online segment compaction.
//!
//! Compaction rewrites a segment's live entries contiguously at its base,
//! then rewinds the append head and clears the dead-space accounting. It
//! runs under the segment write lock, so foreground byte access is excluded
//! for the duration; per-cell locks are not taken. The index update is the
//! linearization point for each move: a reader that resolved an address
//! before the move re-resolves it after acquiring the segment lock, and a
//! concurrent cross-segment relocation that wins the index first simply
//! turns this segment's copy into droppable residue.

use tracing::{debug, error};

use crate::cell::{CellHeader, CellType, EntryWalk};
use crate::error::Result;
use crate::trunk::segment::Segment;
use crate::trunk::Trunk;

/// Segments whose alive ratio falls below this are compacted by the
/// background sweep.
pub const DEFRAG_TRIGGER_RATIO: f32 = 0.7;

/// Compacts every segment of the trunk whose alive ratio is below
/// `threshold`, serially. Returns the number of segments compacted. Errors
/// are logged per segment; one corrupt segment does not stop the sweep.
pub fn compact_trunk(trunk: &Trunk, threshold: f32) -> usize {
    let mut compacted = 0;
    for seg in trunk.segments() {
        if seg.alive_ratio() >= threshold {
            continue;
        }
        match compact_segment(trunk, seg) {
            Ok(reclaimed) => {
                compacted += 1;
                debug!(
                    trunk = trunk.id,
                    segment = seg.id,
                    reclaimed,
                    "compacted segment"
                );
            }
            Err(e) => {
                error!(
                    trunk = trunk.id,
                    segment = seg.id,
                    error = %e,
                    "segment compaction failed"
                );
            }
        }
    }
    compacted
}

/// Compacts one segment, returning the bytes reclaimed.
pub fn compact_segment(trunk: &Trunk, seg: &Segment) -> Result<usize> {
    let _guard = seg.write()?;
    let base = seg.base();
    let head = seg.append_head();
    if head == base {
        return Ok(0);
    }

    // First pass: validate the whole entry chain before touching any bytes,
    // so a malformed header leaves the segment untouched.
    let region = unsafe { trunk.memory().slice(base, head - base) };
    let mut live = Vec::new();
    for entry in EntryWalk::new(region) {
        let (offset, header) = entry?;
        if header.cell_type == CellType::Normal {
            live.push((base + offset, header));
        }
    }

    // Second pass: copy live entries down. An entry whose index no longer
    // points at it lost a race with a cross-segment relocation and is
    // dropped as residue.
    let mut write = base;
    for (addr, header) in live {
        let entry_len = header.entry_len();
        if !trunk.index_cas(header.hash, addr, write) {
            continue;
        }
        if write != addr {
            unsafe { trunk.memory().copy_within(addr, write, entry_len) };
            trunk.mark_dirty(write, write + entry_len)?;
        }
        write += entry_len;
    }

    let reclaimed = head - write;
    if reclaimed > 0 {
        unsafe { trunk.memory().fill_zero(write, reclaimed) };
    }
    seg.reset_after_compaction(write)?;
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::cell::CELL_HEADER_SIZE;
    use crate::error::Error;
    use crate::id::Id;
    use crate::schema::{Field, Schema, SchemaTable};
    use crate::trunk::segment::SEGMENT_SIZE;
    use crate::types::{PrimType, Value};

    fn text_trunk() -> (Trunk, u32) {
        let schemas = Arc::new(SchemaTable::new());
        let schema_id = schemas
            .add(Schema::new("note", vec![Field::prim("s", PrimType::Text)]))
            .unwrap();
        (Trunk::new(0, SEGMENT_SIZE, schemas, true).unwrap(), schema_id)
    }

    fn text_value(s: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert("s".to_string(), Value::Text(s.to_string()));
        Value::Map(map)
    }

    #[test]
    fn test_compaction_drops_tombstones_keeps_live() {
        let (trunk, schema_id) = text_trunk();
        for i in 0..10u64 {
            trunk
                .new_cell(Id::new(1, i), schema_id, &text_value(&format!("cell {i}")))
                .unwrap();
        }
        for i in (0..10u64).step_by(2) {
            trunk.delete_cell(i).unwrap();
        }
        let seg = &trunk.segments()[0];
        let live_bytes: usize = (0..10u64)
            .filter(|i| i % 2 == 1)
            .map(|i| trunk.head_cell(i).unwrap().entry_len())
            .sum();

        let reclaimed = compact_segment(&trunk, seg).unwrap();
        assert!(reclaimed > 0);
        assert_eq!(seg.used_bytes(), live_bytes);
        assert_eq!(seg.dead_bytes(), 0);
        assert!(seg.fragments().unwrap().is_empty());

        for i in 0..10u64 {
            if i % 2 == 0 {
                assert_eq!(trunk.read_cell(i).err(), Some(Error::NotFound));
            } else {
                let Value::Map(map) = trunk.read_cell(i).unwrap() else {
                    panic!("not a map");
                };
                assert_eq!(map["s"], Value::Text(format!("cell {i}")));
            }
        }
    }

    #[test]
    fn test_compaction_resets_shrink_accounting() {
        let (trunk, schema_id) = text_trunk();
        trunk
            .new_cell(Id::new(1, 1), schema_id, &text_value("a long initial value"))
            .unwrap();
        trunk.replace_cell(1, &text_value("x")).unwrap();

        let seg = &trunk.segments()[0];
        assert!(seg.dead_bytes() > 0);
        compact_segment(&trunk, seg).unwrap();
        assert_eq!(seg.dead_bytes(), 0);
        // The entry kept its extent; the cell still reads back.
        let Value::Map(map) = trunk.read_cell(1).unwrap() else {
            panic!("not a map");
        };
        assert_eq!(map["s"], Value::Text("x".to_string()));
    }

    #[test]
    fn test_sweep_respects_threshold() {
        let (trunk, schema_id) = text_trunk();
        for i in 0..8u64 {
            trunk
                .new_cell(Id::new(1, i), schema_id, &text_value("payload"))
                .unwrap();
        }
        trunk.delete_cell(0).unwrap();
        let seg = &trunk.segments()[0];
        let head_before = seg.append_head();

        // One dead entry out of eight keeps the ratio above 0.7.
        assert_eq!(compact_trunk(&trunk, DEFRAG_TRIGGER_RATIO), 0);
        assert_eq!(seg.append_head(), head_before);

        // A full sweep compacts anything with dead space.
        assert_eq!(compact_trunk(&trunk, 1.0), 1);
        assert!(seg.append_head() < head_before);
    }

    #[test]
    fn test_allocation_failure_triggers_compaction() {
        let (trunk, schema_id) = text_trunk();
        // Two cells fill the segment exactly.
        let body_overhead = CELL_HEADER_SIZE + 4;
        let half = SEGMENT_SIZE / 2 - body_overhead;
        let big = "b".repeat(half);
        trunk.new_cell(Id::new(1, 1), schema_id, &text_value(&big)).unwrap();
        trunk.new_cell(Id::new(1, 2), schema_id, &text_value(&big)).unwrap();
        assert_eq!(
            trunk
                .new_cell(Id::new(1, 3), schema_id, &text_value(&big))
                .err(),
            Some(Error::StoreFull)
        );

        // Deleting one frees enough for the retry path inside allocation.
        trunk.delete_cell(1).unwrap();
        trunk.new_cell(Id::new(1, 3), schema_id, &text_value(&big)).unwrap();
        let Value::Map(map) = trunk.read_cell(3).unwrap() else {
            panic!("not a map");
        };
        assert_eq!(map["s"], Value::Text(big));
    }

    #[test]
    fn test_index_headers_consistent_after_churn() {
        let (trunk, schema_id) = text_trunk();
        for i in 0..50u64 {
            trunk
                .new_cell(Id::new(1, i), schema_id, &text_value(&"x".repeat(40)))
                .unwrap();
        }
        for i in 0..50u64 {
            match i % 4 {
                0 => trunk.delete_cell(i).unwrap(),
                1 => trunk.replace_cell(i, &text_value("s")).unwrap(),
                2 => trunk
                    .replace_cell(i, &text_value(&"y".repeat(200)))
                    .unwrap(),
                _ => {}
            }
        }
        compact_trunk(&trunk, 1.0);

        for i in 0..50u64 {
            let Some(addr) = trunk.locate(i) else {
                assert_eq!(i % 4, 0);
                continue;
            };
            let seg = trunk.segment_for(addr);
            let _guard = seg.read().unwrap();
            let header = CellHeader::decode(unsafe {
                trunk.memory().slice(addr, CELL_HEADER_SIZE)
            })
            .unwrap();
            assert_eq!(header.cell_type, CellType::Normal);
            assert_eq!(header.hash, i);
            assert!(addr + header.entry_len() <= seg.append_head());
        }
        for seg in trunk.segments() {
            assert!(seg.dead_bytes() <= seg.used_bytes());
            assert!(seg.used_bytes() <= SEGMENT_SIZE);
        }
    }

    #[test]
    fn test_compaction_marks_moved_regions_dirty() {
        let (trunk, schema_id) = text_trunk();
        trunk.new_cell(Id::new(1, 1), schema_id, &text_value("first")).unwrap();
        trunk.new_cell(Id::new(1, 2), schema_id, &text_value("second")).unwrap();
        trunk.delete_cell(1).unwrap();
        trunk.take_dirty().unwrap();

        compact_segment(&trunk, &trunk.segments()[0]).unwrap();
        // The surviving cell moved to the segment base and was re-marked.
        let dirty = trunk.take_dirty().unwrap();
        let entry_len = trunk.head_cell(2).unwrap().entry_len();
        assert_eq!(dirty.get(&0), Some(&(entry_len as u64)));
    }
}

//! Cell headers and the segment entry walk.
//!
//! Every entry in a segment, live or tombstoned, starts with a fixed 33-byte
//! header:
//!
//! ```text
//! +--------+-----------+-----------+-------------+-----------+---------+
//! | hash   | partition | schema_id | cell_length | cell_type | version |
//! | u64    | u64       | u32       | u32         | u8        | u64     |
//! +--------+-----------+-----------+-------------+-----------+---------+
//! ```
//!
//! All integers are big-endian. `cell_length` is the byte extent of the body
//! that follows the header; an in-place shrink may leave the logical value
//! shorter than the extent, so entries stay self-describing for the segment
//! walks the defragmenter and recovery perform.

use byteorder::{BigEndian, ByteOrder};

use crate::errdata;
use crate::error::{Error, Result};
use crate::id::Id;

pub const CELL_HEADER_SIZE: usize = 33;

/// Entry kind discriminant stored in `cell_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellType {
    Normal = 1,
    Tombstone = 2,
}

impl TryFrom<u8> for CellType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<CellType> {
        match byte {
            1 => Ok(CellType::Normal),
            2 => Ok(CellType::Tombstone),
            other => Err(errdata!("invalid cell type {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellHeader {
    pub hash: u64,
    pub partition: u64,
    pub schema_id: u32,
    pub cell_length: u32,
    pub cell_type: CellType,
    pub version: u64,
}

impl CellHeader {
    pub fn new(id: Id, schema_id: u32, cell_length: u32, version: u64) -> CellHeader {
        CellHeader {
            hash: id.hash,
            partition: id.partition,
            schema_id,
            cell_length,
            cell_type: CellType::Normal,
            version,
        }
    }

    pub fn id(&self) -> Id {
        Id::new(self.partition, self.hash)
    }

    /// The full entry extent, header included.
    pub fn entry_len(&self) -> usize {
        CELL_HEADER_SIZE + self.cell_length as usize
    }

    pub fn encode(&self) -> [u8; CELL_HEADER_SIZE] {
        let mut buf = [0u8; CELL_HEADER_SIZE];
        BigEndian::write_u64(&mut buf[0..8], self.hash);
        BigEndian::write_u64(&mut buf[8..16], self.partition);
        BigEndian::write_u32(&mut buf[16..20], self.schema_id);
        BigEndian::write_u32(&mut buf[20..24], self.cell_length);
        buf[24] = self.cell_type as u8;
        BigEndian::write_u64(&mut buf[25..33], self.version);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<CellHeader> {
        if buf.len() < CELL_HEADER_SIZE {
            return Err(errdata!(
                "cell header needs {CELL_HEADER_SIZE} bytes, got {}",
                buf.len()
            ));
        }
        Ok(CellHeader {
            hash: BigEndian::read_u64(&buf[0..8]),
            partition: BigEndian::read_u64(&buf[8..16]),
            schema_id: BigEndian::read_u32(&buf[16..20]),
            cell_length: BigEndian::read_u32(&buf[20..24]),
            cell_type: CellType::try_from(buf[24])?,
            version: BigEndian::read_u64(&buf[25..33]),
        })
    }
}

/// Walks entries in an append-ordered byte region, yielding the offset and
/// header of each. Stops at the region end; a header overrunning it or a
/// malformed type byte yields an error and ends the walk.
pub struct EntryWalk<'a> {
    buf: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> EntryWalk<'a> {
    /// `buf` must span exactly the written region, base to append head.
    pub fn new(buf: &'a [u8]) -> EntryWalk<'a> {
        EntryWalk {
            buf,
            cursor: 0,
            failed: false,
        }
    }
}

impl Iterator for EntryWalk<'_> {
    type Item = Result<(usize, CellHeader)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.buf.len() {
            return None;
        }
        let offset = self.cursor;
        let header = match CellHeader::decode(&self.buf[offset..]) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let end = offset + header.entry_len();
        if end > self.buf.len() {
            self.failed = true;
            return Some(Err(errdata!(
                "entry at {offset} runs to {end}, past region end {}",
                self.buf.len()
            )));
        }
        self.cursor = end;
        Some(Ok((offset, header)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(hash: u64, len: u32) -> CellHeader {
        CellHeader::new(Id::new(9, hash), 3, len, 100)
    }

    #[test]
    fn test_header_round_trip() {
        let mut h = header(u64::MAX, 4096);
        h.cell_type = CellType::Tombstone;
        let encoded = h.encode();
        assert_eq!(encoded.len(), CELL_HEADER_SIZE);
        assert_eq!(CellHeader::decode(&encoded).unwrap(), h);
    }

    #[test]
    fn test_decode_rejects_bad_type() {
        let mut encoded = header(1, 0).encode();
        encoded[24] = 99;
        assert!(CellHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let encoded = header(1, 0).encode();
        assert!(CellHeader::decode(&encoded[..CELL_HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn test_entry_walk() {
        let mut region = Vec::new();
        for (hash, len) in [(1u64, 8u32), (2, 0), (3, 16)] {
            region.extend_from_slice(&header(hash, len).encode());
            region.extend(std::iter::repeat(0xab).take(len as usize));
        }
        let entries: Vec<_> = EntryWalk::new(&region).collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, 0);
        assert_eq!(entries[1].0, CELL_HEADER_SIZE + 8);
        assert_eq!(entries[2].1.hash, 3);
    }

    #[test]
    fn test_entry_walk_overrun() {
        let mut region = header(1, 100).encode().to_vec();
        region.extend_from_slice(&[0; 10]);
        let mut walk = EntryWalk::new(&region);
        assert!(walk.next().unwrap().is_err());
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_entry_walk_empty() {
        assert!(EntryWalk::new(&[]).next().is_none());
    }
}

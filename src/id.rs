use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use crc::Crc;
use serde::{Deserialize, Serialize};

/// CRC-64 algorithm hashing string keys into the low half of an id.
pub const HASH_CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_ECMA_182);
/// CRC-64 algorithm hashing string keys into the partition half. A different
/// polynomial than [`HASH_CRC`] so the two halves are uncorrelated.
pub const PARTITION_CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);

/// A 128-bit cell identifier.
///
/// The high half selects the owning trunk (`partition % trunk_count`), the
/// low half keys the trunk's cell index. Placement is content-addressed:
/// ids derived from the same key always land on the same trunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id {
    pub partition: u64,
    pub hash: u64,
}

impl Id {
    pub fn new(partition: u64, hash: u64) -> Self {
        Self { partition, hash }
    }

    /// Derives an id from an arbitrary key.
    pub fn from_key(key: &[u8]) -> Self {
        Self {
            partition: PARTITION_CRC.checksum(key),
            hash: HASH_CRC.checksum(key),
        }
    }

    /// Big-endian 16-byte form, partition first.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        BigEndian::write_u64(&mut buf[0..8], self.partition);
        BigEndian::write_u64(&mut buf[8..16], self.hash);
        buf
    }

    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        Self {
            partition: BigEndian::read_u64(&buf[0..8]),
            hash: BigEndian::read_u64(&buf[8..16]),
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.partition, self.hash)
    }
}

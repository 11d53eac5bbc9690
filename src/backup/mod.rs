//! The durability writer: dirty-range shipping to replica files.
//!
//! Trunks accumulate coalesced dirty ranges as mutations land. A backup
//! cycle snapshots each segment's append head, drains the range map, and
//! emits one [`SegmentUpdate`] per in-window range through a bounded queue.
//! A dedicated consumer applies updates to every replica target off the
//! foreground path. Ranges past a snapshot boundary are requeued for the
//! next cycle.
//!
//! # Replica file format
//!
//! One file per trunk, all integers big-endian:
//!
//! ```text
//! +--------------------+
//! | segment_size: u32  |
//! +--------------------+
//! | seg 0 append: u32  |
//! | seg 0 content      |  segment_size bytes
//! +--------------------+
//! | seg 1 append: u32  |
//! | ...                |
//! ```
//!
//! Applying an update writes the segment's append head and the range bytes
//! at their mapped offset, then flushes. After a cycle the replica is
//! byte-equal to the snapshot for `[base, base + append_head)` of every
//! segment.

pub mod recovery;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::trunk::segment::SEGMENT_SIZE;
use crate::trunk::Trunk;

/// In-flight message bound for the shipping queue.
const SHIPPER_QUEUE_DEPTH: usize = 64;

/// One byte-range image of a segment at a snapshot append head.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentUpdate {
    pub trunk_id: u32,
    pub segment_id: u32,
    /// Range start relative to the segment base.
    pub offset: u32,
    /// Segment append head (relative) at the cycle's snapshot.
    pub append_head: u32,
    pub bytes: Vec<u8>,
}

/// Where segment updates land. The in-tree implementation is a
/// directory-backed file replica; the RPC layer substitutes remote targets.
pub trait ReplicaTarget: Send + Sync {
    fn apply(&self, update: &SegmentUpdate) -> Result<()>;
}

enum ShipMessage {
    Update(SegmentUpdate),
    Flush(oneshot::Sender<()>),
}

/// The bounded-queue consumer shipping updates to every replica target.
pub struct BackupShipper {
    tx: mpsc::Sender<ShipMessage>,
    consumer: JoinHandle<()>,
}

impl BackupShipper {
    pub fn new(targets: Vec<Arc<dyn ReplicaTarget>>) -> BackupShipper {
        let (tx, mut rx) = mpsc::channel::<ShipMessage>(SHIPPER_QUEUE_DEPTH);
        let consumer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ShipMessage::Update(update) => {
                        for target in &targets {
                            if let Err(e) = target.apply(&update) {
                                error!(
                                    trunk = update.trunk_id,
                                    segment = update.segment_id,
                                    error = %e,
                                    "replica write failed"
                                );
                            }
                        }
                    }
                    ShipMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        BackupShipper { tx, consumer }
    }

    pub async fn ship(&self, update: SegmentUpdate) -> Result<()> {
        self.tx
            .send(ShipMessage::Update(update))
            .await
            .map_err(|_| Error::IO("backup consumer gone".to_string()))
    }

    /// Resolves once every update enqueued before it has been applied.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ShipMessage::Flush(done_tx))
            .await
            .map_err(|_| Error::IO("backup consumer gone".to_string()))?;
        done_rx
            .await
            .map_err(|_| Error::IO("backup consumer gone".to_string()))
    }

    pub async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.consumer.await?;
        Ok(())
    }
}

/// Runs one backup cycle for a trunk: snapshot heads, drain dirty ranges,
/// emit per-range segment updates. Returns the number of updates shipped.
pub async fn sync_trunk(trunk: &Trunk, shipper: &BackupShipper) -> Result<usize> {
    let segments = trunk.segments();
    let heads: Vec<u64> = segments
        .iter()
        .map(|seg| trunk.append_head_value(seg))
        .collect();
    let dirty = trunk.take_dirty()?;

    let mut updates = 0;
    let mut shipped = vec![false; segments.len()];
    for (lo, hi) in dirty {
        // Coalescing can bridge segment boundaries; emit per segment.
        let mut lo = lo;
        while lo < hi {
            let seg_index = lo as usize / SEGMENT_SIZE;
            let seg = &segments[seg_index];
            let seg_base = seg.base() as u64;
            let seg_end = seg_base + SEGMENT_SIZE as u64;
            let piece_hi = hi.min(seg_end);
            let window_end = seg_base + heads[seg_index];
            if lo >= window_end {
                // Entirely past the snapshot; belongs to the next cycle.
                trunk.requeue_dirty(lo, piece_hi)?;
            } else {
                let in_window_hi = piece_hi.min(window_end);
                if in_window_hi < piece_hi {
                    trunk.requeue_dirty(in_window_hi, piece_hi)?;
                }
                let bytes = {
                    // The write lock excludes in-place rewrites (readers of
                    // the segment lock) for the brief copy, so a drained
                    // range can never ship torn bytes.
                    let _guard = seg.write()?;
                    unsafe {
                        trunk
                            .memory()
                            .slice(lo as usize, (in_window_hi - lo) as usize)
                    }
                    .to_vec()
                };
                shipper
                    .ship(SegmentUpdate {
                        trunk_id: trunk.id,
                        segment_id: seg.id,
                        offset: (lo - seg_base) as u32,
                        append_head: heads[seg_index] as u32,
                        bytes,
                    })
                    .await?;
                updates += 1;
                shipped[seg_index] = true;
            }
            lo = piece_hi;
        }
    }

    // Segments whose head moved without any in-window dirty bytes (e.g. a
    // compaction rewind) still need their head record refreshed.
    for (seg_index, seg) in segments.iter().enumerate() {
        let head = heads[seg_index];
        if !shipped[seg_index] && head as usize != seg.last_backup_head() {
            shipper
                .ship(SegmentUpdate {
                    trunk_id: trunk.id,
                    segment_id: seg.id,
                    offset: 0,
                    append_head: head as u32,
                    bytes: Vec::new(),
                })
                .await?;
            updates += 1;
            shipped[seg_index] = true;
        }
        if shipped[seg_index] {
            seg.set_last_backup_head(head as usize);
        }
    }
    debug!(trunk = trunk.id, updates, "backup cycle complete");
    Ok(updates)
}

/// A replica directory holding one file per trunk.
pub struct FileReplica {
    dir: PathBuf,
    files: Mutex<HashMap<u32, File>>,
}

impl FileReplica {
    pub fn open(dir: impl Into<PathBuf>) -> Result<FileReplica> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FileReplica {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn trunk_file(dir: &std::path::Path, trunk_id: u32) -> PathBuf {
        dir.join(format!("trunk-{trunk_id}.neb"))
    }

    fn record_offset(segment_id: u32) -> u64 {
        4 + segment_id as u64 * (4 + SEGMENT_SIZE as u64)
    }
}

impl ReplicaTarget for FileReplica {
    fn apply(&self, update: &SegmentUpdate) -> Result<()> {
        let mut files = self.files.lock()?;
        let file = match files.entry(update.trunk_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let path = Self::trunk_file(&self.dir, update.trunk_id);
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                if file.metadata()?.len() < 4 {
                    let mut size_header = [0u8; 4];
                    BigEndian::write_u32(&mut size_header, SEGMENT_SIZE as u32);
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(&size_header)?;
                }
                slot.insert(file)
            }
        };

        let record = Self::record_offset(update.segment_id);
        let mut head = [0u8; 4];
        BigEndian::write_u32(&mut head, update.append_head);
        file.seek(SeekFrom::Start(record))?;
        file.write_all(&head)?;
        if !update.bytes.is_empty() {
            file.seek(SeekFrom::Start(record + 4 + update.offset as u64))?;
            file.write_all(&update.bytes)?;
        }
        // Keep the record rectangular so recovery can read whole segments.
        let record_end = record + 4 + SEGMENT_SIZE as u64;
        if file.metadata()?.len() < record_end {
            file.set_len(record_end)?;
        }
        file.sync_data()?;
        Ok(())
    }
}

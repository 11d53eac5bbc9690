//! Recovery: rebuilding trunks from replica directories.
//!
//! Each replica directory not yet marked `imported` is scanned for trunk
//! files. Segment images are read record by record and walked header by
//! header up to the recorded append head; normal cells are installed through
//! `new_cell_by_raw_if_newer`, routed by partition, and tombstones are
//! skipped. Placement is content-addressed, so a cell may land on a
//! different trunk than the one that backed it up. A corrupt file is logged
//! and skipped; partial recovery is acceptable.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cell::{CellType, EntryWalk};
use crate::error::{Error, Result};
use crate::trunk::segment::SEGMENT_SIZE;
use crate::trunk::Trunk;

/// Marker file tagging a replica directory as already imported.
pub const IMPORTED_MARKER: &str = "imported";

/// Segment-level recovery parallelism.
fn recovery_permits() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.min(10)
}

/// Recovers every unimported replica directory under `root`. Returns the
/// number of cells installed.
pub async fn recover_from_root(
    trunks: &[Arc<Trunk>],
    root: &Path,
    keep_imported: bool,
) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    let mut installed = 0;
    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    for dir in dirs {
        if dir.join(IMPORTED_MARKER).exists() {
            continue;
        }
        installed += recover_replica_dir(trunks, &dir).await?;
        if keep_imported {
            fs::write(dir.join(IMPORTED_MARKER), b"")?;
        } else {
            fs::remove_dir_all(&dir)?;
        }
    }
    Ok(installed)
}

/// Recovers one replica directory's trunk files.
pub async fn recover_replica_dir(trunks: &[Arc<Trunk>], dir: &Path) -> Result<usize> {
    let semaphore = Arc::new(Semaphore::new(recovery_permits()));
    let mut tasks = Vec::new();
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "neb"))
        .collect();
    files.sort();

    for path in files {
        let images = match read_segment_images(&path) {
            Ok(images) => images,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping corrupt replica file");
                continue;
            }
        };
        for image in images {
            let trunks = trunks.to_vec();
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                install_segment_image(&trunks, &image)
            }));
        }
    }

    let mut installed = 0;
    for task in tasks {
        installed += task.await??;
    }
    info!(dir = %dir.display(), installed, "replica directory recovered");
    Ok(installed)
}

/// Reads every non-empty segment image from a trunk replica file, trimmed to
/// its recorded append head. A corrupt file yields what was readable before
/// the corruption, after logging.
fn read_segment_images(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut file = File::open(path)?;
    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let segment_size = BigEndian::read_u32(&word) as usize;
    if segment_size != SEGMENT_SIZE {
        warn!(
            file = %path.display(),
            segment_size,
            "replica written with a different segment size, skipping"
        );
        return Err(Error::CorruptReplica(format!(
            "segment size {segment_size}, expected {SEGMENT_SIZE}"
        )));
    }

    let mut images = Vec::new();
    loop {
        match file.read_exact(&mut word) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let head = BigEndian::read_u32(&word) as usize;
        if head > SEGMENT_SIZE {
            warn!(file = %path.display(), head, "append head past segment size");
            return Err(Error::CorruptReplica(format!(
                "append head {head} exceeds segment size"
            )));
        }
        let mut content = vec![0u8; SEGMENT_SIZE];
        file.read_exact(&mut content)?;
        if head > 0 {
            content.truncate(head);
            images.push(content);
        }
    }
    Ok(images)
}

/// Walks one segment image and installs its live cells. Walk errors end the
/// image after logging; cells already installed stay.
fn install_segment_image(trunks: &[Arc<Trunk>], image: &[u8]) -> Result<usize> {
    let mut installed = 0;
    for entry in EntryWalk::new(image) {
        let (offset, header) = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "segment image walk stopped early");
                break;
            }
        };
        if header.cell_type != CellType::Normal {
            continue;
        }
        let id = header.id();
        let trunk = &trunks[(id.partition % trunks.len() as u64) as usize];
        let bytes = &image[offset..offset + header.entry_len()];
        match trunk.new_cell_by_raw_if_newer(id, header.version, bytes) {
            Ok(true) => installed += 1,
            Ok(false) => {}
            Err(e) => warn!(cell = %id, error = %e, "cell install failed"),
        }
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::backup::{sync_trunk, BackupShipper, FileReplica, ReplicaTarget};
    use crate::id::Id;
    use crate::schema::{Field, Schema, SchemaTable};
    use crate::tmpfs::TestDir;
    use crate::types::{PrimType, Value};

    fn text_value(s: &str) -> Value {
        let mut map = BTreeMap::new();
        map.insert("s".to_string(), Value::Text(s.to_string()));
        Value::Map(map)
    }

    fn two_trunks(schemas: &Arc<SchemaTable>) -> Vec<Arc<Trunk>> {
        (0..2)
            .map(|i| Arc::new(Trunk::new(i, SEGMENT_SIZE, Arc::clone(schemas), true).unwrap()))
            .collect()
    }

    async fn backup_all(trunks: &[Arc<Trunk>], dir: &Path) {
        let replica: Arc<dyn ReplicaTarget> = Arc::new(FileReplica::open(dir).unwrap());
        let shipper = BackupShipper::new(vec![replica]);
        for trunk in trunks {
            sync_trunk(trunk, &shipper).await.unwrap();
        }
        shipper.flush().await.unwrap();
        shipper.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_backup_then_recover_round_trip() {
        let tmp = TestDir::new().unwrap();
        let root = tmp.backup_root();
        let replica_dir = tmp.replica_dir(0);

        let schemas = Arc::new(SchemaTable::new());
        let schema_id = schemas
            .add(Schema::new("note", vec![Field::prim("s", PrimType::Text)]))
            .unwrap();
        let trunks = two_trunks(&schemas);

        let mut ids = Vec::new();
        for i in 0..50 {
            let id = Id::from_key(format!("key-{i}").as_bytes());
            let trunk = &trunks[(id.partition % 2) as usize];
            trunk
                .new_cell(id, schema_id, &text_value(&format!("value {i}")))
                .unwrap();
            ids.push(id);
        }
        backup_all(&trunks, &replica_dir).await;

        // A fresh pair of trunks, as after a crash.
        let recovered_trunks = two_trunks(&schemas);
        let installed = recover_from_root(&recovered_trunks, &root, true)
            .await
            .unwrap();
        assert_eq!(installed, 50);
        assert!(replica_dir.join(IMPORTED_MARKER).exists());

        for (i, id) in ids.iter().enumerate() {
            let trunk = &recovered_trunks[(id.partition % 2) as usize];
            let Value::Map(map) = trunk.read_cell(id.hash).unwrap() else {
                panic!("not a map");
            };
            assert_eq!(map["s"], Value::Text(format!("value {i}")));
        }

        // Marked imported: a second pass is a no-op.
        let again = recover_from_root(&recovered_trunks, &root, true)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_recovery_skips_tombstones() {
        let tmp = TestDir::new().unwrap();
        let root = tmp.backup_root();

        let schemas = Arc::new(SchemaTable::new());
        let schema_id = schemas
            .add(Schema::new("note", vec![Field::prim("s", PrimType::Text)]))
            .unwrap();
        let trunks = two_trunks(&schemas);
        let keep = Id::from_key(b"keep");
        let drop_ = Id::from_key(b"drop");
        for id in [keep, drop_] {
            trunks[(id.partition % 2) as usize]
                .new_cell(id, schema_id, &text_value("x"))
                .unwrap();
        }
        trunks[(drop_.partition % 2) as usize]
            .delete_cell(drop_.hash)
            .unwrap();
        backup_all(&trunks, &tmp.replica_dir(0)).await;

        let recovered = two_trunks(&schemas);
        let installed = recover_from_root(&recovered, &root, false).await.unwrap();
        assert_eq!(installed, 1);
        assert!(recovered[(keep.partition % 2) as usize]
            .read_cell(keep.hash)
            .is_ok());
        assert!(recovered[(drop_.partition % 2) as usize]
            .read_cell(drop_.hash)
            .is_err());
        // Directory consumed when imports are not kept.
        assert!(!tmp.replica_dir(0).exists());
    }

    #[tokio::test]
    async fn test_recovery_keeps_newer_local_cell() {
        let tmp = TestDir::new().unwrap();
        let root = tmp.backup_root();

        let schemas = Arc::new(SchemaTable::new());
        let schema_id = schemas
            .add(Schema::new("note", vec![Field::prim("s", PrimType::Text)]))
            .unwrap();
        let trunks = two_trunks(&schemas);
        let id = Id::from_key(b"contended");
        let trunk = &trunks[(id.partition % 2) as usize];
        trunk.new_cell(id, schema_id, &text_value("old")).unwrap();
        backup_all(&trunks, &tmp.replica_dir(0)).await;

        // The cell advances past the backed-up version before recovery runs.
        trunk.replace_cell(id.hash, &text_value("newer")).unwrap();
        let installed = recover_from_root(&trunks, &root, false).await.unwrap();
        assert_eq!(installed, 0);
        let Value::Map(map) = trunk.read_cell(id.hash).unwrap() else {
            panic!("not a map");
        };
        assert_eq!(map["s"], Value::Text("newer".to_string()));
    }

    #[test]
    fn test_corrupt_file_reports() {
        let tmp = TestDir::new().unwrap();
        let path = tmp.path().join("trunk-0.neb");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(SEGMENT_SIZE as u32).to_be_bytes());
        // Head claims more than a segment holds.
        bytes.extend_from_slice(&(SEGMENT_SIZE as u32 + 1).to_be_bytes());
        bytes.extend_from_slice(&vec![0u8; SEGMENT_SIZE]);
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            read_segment_images(&path),
            Err(Error::CorruptReplica(_))
        ));
    }
}

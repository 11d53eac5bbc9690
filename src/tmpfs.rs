//! Throwaway filesystem roots for tests.
//!
//! Tests point nodes at a scratch root laid out the way a node expects its
//! on-disk surroundings: a backup root holding `replica-N` directories and
//! a schema file path. The whole root is removed on drop.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct TestDir {
    root: PathBuf,
}

impl TestDir {
    pub fn new() -> io::Result<TestDir> {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "nebdb-scratch-{}-{seq}",
            std::process::id()
        ));
        if root.exists() {
            fs::remove_dir_all(&root)?;
        }
        fs::create_dir_all(&root)?;
        Ok(TestDir { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The directory a node's `backup_dir` points at.
    pub fn backup_root(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// One replica directory under the backup root, matching the layout the
    /// durability writer creates.
    pub fn replica_dir(&self, index: usize) -> PathBuf {
        self.backup_root().join(format!("replica-{index}"))
    }

    /// The node's schema file path.
    pub fn schema_file(&self) -> PathBuf {
        self.root.join("schemas")
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::errdata;
use crate::error::Result;
use crate::trunk::segment::SEGMENT_SIZE;

/// Configuration for a storage node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Total managed memory for the node (default: 64MiB)
    pub memory_size: usize,

    /// Bytes per trunk; `memory_size / trunks_size` trunks are created
    /// (default: 16MiB)
    pub trunks_size: usize,

    /// Track dirty ranges for the durability writer (default: false)
    pub durability: bool,

    /// Replica targets per trunk (default: 1)
    pub replication: usize,

    /// Run the periodic backup loop (default: false)
    pub auto_backsync: bool,

    /// Recover from unimported replica directories at startup (default: false)
    pub recover_backup_at_startup: bool,

    /// Retain replica directories after import (default: false)
    pub keep_imported_backup: bool,

    /// Root directory for replica directories; required when durability
    /// features are on
    pub backup_dir: Option<PathBuf>,

    /// Schema file loaded at startup and written at shutdown
    pub schema_file: Option<PathBuf>,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to sweep trunks for compactable segments (default: 10s)
    pub defrag_interval: Duration,

    /// How often to run a backup cycle (default: 10s)
    pub backsync_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            memory_size: 64 * 1024 * 1024,
            trunks_size: 16 * 1024 * 1024,
            durability: false,
            replication: 1,
            auto_backsync: false,
            recover_backup_at_startup: false,
            keep_imported_backup: false,
            backup_dir: None,
            schema_file: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            defrag_interval: Duration::from_secs(10),
            backsync_interval: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set total managed memory
    pub fn memory_size(mut self, size: usize) -> Self {
        self.memory_size = size;
        self
    }

    /// Set bytes per trunk
    pub fn trunks_size(mut self, size: usize) -> Self {
        self.trunks_size = size;
        self
    }

    /// Enable dirty-range tracking
    pub fn durability(mut self, enabled: bool) -> Self {
        self.durability = enabled;
        self
    }

    /// Set replica target count
    pub fn replication(mut self, count: usize) -> Self {
        self.replication = count;
        self
    }

    /// Enable the periodic backup loop
    pub fn auto_backsync(mut self, enabled: bool) -> Self {
        self.auto_backsync = enabled;
        self
    }

    /// Recover from replica directories at startup
    pub fn recover_backup_at_startup(mut self, enabled: bool) -> Self {
        self.recover_backup_at_startup = enabled;
        self
    }

    /// Retain imported replica directories
    pub fn keep_imported_backup(mut self, enabled: bool) -> Self {
        self.keep_imported_backup = enabled;
        self
    }

    /// Set the replica root directory
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Set the schema file path
    pub fn schema_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_file = Some(path.into());
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Trunks this configuration yields.
    pub fn trunk_count(&self) -> usize {
        self.memory_size / self.trunks_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.trunks_size < SEGMENT_SIZE {
            return Err(errdata!(
                "trunks_size {} is smaller than a segment ({SEGMENT_SIZE})",
                self.trunks_size
            ));
        }
        if self.trunk_count() == 0 {
            return Err(errdata!(
                "memory_size {} holds no trunk of {} bytes",
                self.memory_size,
                self.trunks_size
            ));
        }
        if self.replication == 0 {
            return Err(errdata!("replication must be at least 1"));
        }
        if (self.durability || self.auto_backsync || self.recover_backup_at_startup)
            && self.backup_dir.is_none()
        {
            return Err(errdata!("durability features need a backup_dir"));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Set the defrag sweep interval
    pub fn defrag_interval(mut self, interval: Duration) -> Self {
        self.defrag_interval = interval;
        self
    }

    /// Set the backup cycle interval
    pub fn backsync_interval(mut self, interval: Duration) -> Self {
        self.backsync_interval = interval;
        self
    }
}

//! Maintenance tasks for the defragmenter and the durability writer.

use std::sync::Arc;
use std::time::Duration;

use crate::backup::{self, BackupShipper};
use crate::error::Result;
use crate::scheduler::{CycleReport, TrunkTask};
use crate::trunk::defrag::{self, DEFRAG_TRIGGER_RATIO};
use crate::trunk::Trunk;

/// Compacts a trunk's segments when their alive ratio falls below the
/// trigger threshold.
pub struct DefragTask {
    interval: Duration,
}

impl DefragTask {
    pub fn new(interval: Duration) -> DefragTask {
        DefragTask { interval }
    }
}

#[async_trait::async_trait]
impl TrunkTask for DefragTask {
    fn name(&self) -> &'static str {
        "defrag"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, trunk: &Trunk, _cycle: u64) -> Result<CycleReport> {
        let compacted = defrag::compact_trunk(trunk, DEFRAG_TRIGGER_RATIO);
        Ok(CycleReport::touched(compacted))
    }
}

/// Ships a trunk's dirty ranges to the replica targets.
pub struct BacksyncTask {
    shipper: Arc<BackupShipper>,
    interval: Duration,
}

impl BacksyncTask {
    pub fn new(shipper: Arc<BackupShipper>, interval: Duration) -> BacksyncTask {
        BacksyncTask { shipper, interval }
    }
}

#[async_trait::async_trait]
impl TrunkTask for BacksyncTask {
    fn name(&self) -> &'static str {
        "backsync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self, trunk: &Trunk, _cycle: u64) -> Result<CycleReport> {
        let updates = backup::sync_trunk(trunk, &self.shipper).await?;
        Ok(CycleReport::touched(updates))
    }
}

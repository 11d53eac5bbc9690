//! Background maintenance workers.
//!
//! The defragmenter and the durability writer run as long-lived periodic
//! workers, one per task kind. Each cycle a worker walks the node's trunks
//! serially and re-checks the stop flag between trunks, so shutdown never
//! waits on more than one trunk's worth of work. Per-trunk failures are
//! logged and the walk continues; a worker only exits on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::trunk::Trunk;

/// What one task cycle did to one trunk: segments compacted, updates
/// shipped, or the task's equivalent. Summed per cycle for logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub touched: usize,
}

impl CycleReport {
    pub fn touched(touched: usize) -> CycleReport {
        CycleReport { touched }
    }
}

/// A periodic maintenance job over a node's trunks.
#[async_trait::async_trait]
pub trait TrunkTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// Delay between cycles.
    fn interval(&self) -> Duration;

    /// Runs one cycle on one trunk. `cycle` counts completed intervals
    /// since the worker started.
    async fn run(&self, trunk: &Trunk, cycle: u64) -> Result<CycleReport>;
}

/// Owns the maintenance workers and stops them cooperatively.
pub struct Maintenance {
    workers: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Maintenance {
    pub fn new() -> Maintenance {
        let (stop, _) = watch::channel(false);
        Maintenance {
            workers: Vec::new(),
            stop,
        }
    }

    /// Spawns a worker driving `task` over `trunks` on its interval.
    pub fn spawn<T: TrunkTask + 'static>(&mut self, task: Arc<T>, trunks: Vec<Arc<Trunk>>) {
        let mut stop = self.stop.subscribe();
        self.workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cycle = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cycle += 1;
                        let mut touched = 0;
                        for trunk in &trunks {
                            // Stop between trunks, never mid-trunk.
                            if *stop.borrow() {
                                info!(task = task.name(), "worker stopped");
                                return;
                            }
                            match task.run(trunk.as_ref(), cycle).await {
                                Ok(report) => touched += report.touched,
                                Err(e) => error!(
                                    task = task.name(),
                                    trunk = trunk.id,
                                    error = %e,
                                    "maintenance cycle failed"
                                ),
                            }
                        }
                        if touched > 0 {
                            debug!(task = task.name(), cycle, touched, "maintenance cycle");
                        }
                    }

                    _ = stop.changed() => {
                        info!(task = task.name(), "worker stopped");
                        return;
                    }
                }
            }
        }));
    }

    /// Signals every worker and waits for them to finish.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        for worker in self.workers {
            worker.await?;
        }
        Ok(())
    }
}

impl Default for Maintenance {
    fn default() -> Self {
        Self::new()
    }
}

//! The trunk store: a node's trunks behind the in-process cell API.
//!
//! A [`Node`] owns `trunk_count` identical trunks and routes every operation
//! by `partition % trunk_count`. This is the surface the RPC layer adapts;
//! cluster routing decided which node the id belongs to before an operation
//! arrives here.

pub mod funcs;
pub mod tasks;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backup::{self, recovery, BackupShipper, FileReplica, ReplicaTarget};
use crate::cell::CellHeader;
use crate::codec::PathSeg;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::id::Id;
use crate::schema::SchemaTable;
use crate::scheduler::Maintenance;
use crate::trunk::segment::SEGMENT_SIZE;
use crate::trunk::{Trunk, TrunkStats};
use crate::types::Value;
use funcs::FuncRegistry;
use tasks::{BacksyncTask, DefragTask};

pub struct Node {
    config: NodeConfig,
    schemas: Arc<SchemaTable>,
    trunks: Vec<Arc<Trunk>>,
    funcs: FuncRegistry,
    shipper: Option<Arc<BackupShipper>>,
    maintenance: Option<Maintenance>,
}

impl Node {
    /// Creates the node's trunks, loads the schema file, runs startup
    /// recovery when configured, and starts the background tasks.
    pub async fn open(config: NodeConfig) -> Result<Node> {
        config.validate()?;

        let schemas = match &config.schema_file {
            Some(path) if path.exists() => Arc::new(SchemaTable::load(path)?),
            _ => Arc::new(SchemaTable::new()),
        };

        let trunk_size = (config.trunks_size / SEGMENT_SIZE) * SEGMENT_SIZE;
        let trunks = (0..config.trunk_count())
            .map(|i| {
                Trunk::new(i as u32, trunk_size, Arc::clone(&schemas), config.durability)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            trunks = trunks.len(),
            trunk_size, "trunk store initialized"
        );

        if config.recover_backup_at_startup {
            if let Some(root) = &config.backup_dir {
                let installed =
                    recovery::recover_from_root(&trunks, root, config.keep_imported_backup)
                        .await?;
                info!(installed, "startup recovery complete");
            }
        }

        let shipper = if config.durability {
            let root = config.backup_dir.as_ref().unwrap();
            let targets = (0..config.replication)
                .map(|i| {
                    FileReplica::open(root.join(format!("replica-{i}")))
                        .map(|replica| Arc::new(replica) as Arc<dyn ReplicaTarget>)
                })
                .collect::<Result<Vec<_>>>()?;
            Some(Arc::new(BackupShipper::new(targets)))
        } else {
            None
        };

        let mut maintenance = Maintenance::new();
        maintenance.spawn(
            Arc::new(DefragTask::new(config.scheduler.defrag_interval)),
            trunks.clone(),
        );
        if config.auto_backsync {
            if let Some(shipper) = &shipper {
                maintenance.spawn(
                    Arc::new(BacksyncTask::new(
                        Arc::clone(shipper),
                        config.scheduler.backsync_interval,
                    )),
                    trunks.clone(),
                );
            }
        }

        Ok(Node {
            config,
            schemas,
            trunks,
            funcs: FuncRegistry::new(),
            shipper,
            maintenance: Some(maintenance),
        })
    }

    /// Stops background tasks, runs a final backup cycle, and writes the
    /// schema file.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(maintenance) = self.maintenance.take() {
            maintenance.shutdown().await?;
        }
        if self.shipper.is_some() {
            self.sync_trunks().await?;
        }
        if let Some(shipper) = self.shipper.take() {
            // The backsync task's clone is gone once its worker stopped.
            if let Ok(shipper) = Arc::try_unwrap(shipper) {
                shipper.shutdown().await?;
            }
        }
        if let Some(path) = &self.config.schema_file {
            self.schemas.save(path)?;
        }
        Ok(())
    }

    pub fn schemas(&self) -> &SchemaTable {
        &self.schemas
    }

    /// Registers an update function under a symbol for [`Node::update_cell`].
    pub fn register_function<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.funcs.register(name, f)
    }

    fn trunk_of(&self, id: Id) -> &Arc<Trunk> {
        &self.trunks[(id.partition % self.trunks.len() as u64) as usize]
    }

    pub fn new_cell(&self, id: Id, schema_id: u32, value: &Value) -> Result<()> {
        self.trunk_of(id).new_cell(id, schema_id, value)
    }

    pub fn read_cell(&self, id: Id) -> Result<Value> {
        self.trunk_of(id).read_cell(id.hash)
    }

    pub fn head_cell(&self, id: Id) -> Result<CellHeader> {
        self.trunk_of(id).head_cell(id.hash)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.trunk_of(id).contains_hash(id.hash)
    }

    pub fn replace_cell(&self, id: Id, value: &Value) -> Result<()> {
        self.trunk_of(id).replace_cell(id.hash, value)
    }

    /// Applies the function registered under `fn_sym` to the cell's decoded
    /// map and replaces the cell with the result. Returns the new value.
    pub fn update_cell(&self, id: Id, fn_sym: &str, args: &[Value]) -> Result<Value> {
        let apply = self.funcs.get(fn_sym)?;
        self.trunk_of(id)
            .update_cell(id.hash, |value| apply(value, args))
    }

    pub fn delete_cell(&self, id: Id) -> Result<()> {
        self.trunk_of(id).delete_cell(id.hash)
    }

    pub fn get_in_cell(&self, id: Id, path: &[PathSeg]) -> Result<Option<Value>> {
        self.trunk_of(id).get_in_cell(id.hash, path)
    }

    pub fn select_keys_from_cell(&self, id: Id, keys: &[&str]) -> Result<Value> {
        self.trunk_of(id).select_keys_from_cell(id.hash, keys)
    }

    pub fn new_cell_by_raw_if_newer(&self, id: Id, version: u64, bytes: &[u8]) -> Result<bool> {
        self.trunk_of(id).new_cell_by_raw_if_newer(id, version, bytes)
    }

    // Batch variants reduce into a per-id result map; the noreply forms
    // discard results for fire-and-forget callers.

    pub fn new_cells(&self, items: Vec<(Id, u32, Value)>) -> HashMap<Id, Result<()>> {
        items
            .into_iter()
            .map(|(id, schema_id, value)| (id, self.new_cell(id, schema_id, &value)))
            .collect()
    }

    pub fn new_cells_noreply(&self, items: Vec<(Id, u32, Value)>) {
        for (id, schema_id, value) in items {
            let _ = self.new_cell(id, schema_id, &value);
        }
    }

    pub fn read_cells(&self, ids: &[Id]) -> HashMap<Id, Result<Value>> {
        ids.iter().map(|&id| (id, self.read_cell(id))).collect()
    }

    pub fn replace_cells(&self, items: Vec<(Id, Value)>) -> HashMap<Id, Result<()>> {
        items
            .into_iter()
            .map(|(id, value)| (id, self.replace_cell(id, &value)))
            .collect()
    }

    pub fn replace_cells_noreply(&self, items: Vec<(Id, Value)>) {
        for (id, value) in items {
            let _ = self.replace_cell(id, &value);
        }
    }

    pub fn update_cells(
        &self,
        items: Vec<(Id, String, Vec<Value>)>,
    ) -> HashMap<Id, Result<Value>> {
        items
            .into_iter()
            .map(|(id, fn_sym, args)| (id, self.update_cell(id, &fn_sym, &args)))
            .collect()
    }

    pub fn update_cells_noreply(&self, items: Vec<(Id, String, Vec<Value>)>) {
        for (id, fn_sym, args) in items {
            let _ = self.update_cell(id, &fn_sym, &args);
        }
    }

    pub fn delete_cells(&self, ids: &[Id]) -> HashMap<Id, Result<()>> {
        ids.iter().map(|&id| (id, self.delete_cell(id))).collect()
    }

    pub fn delete_cells_noreply(&self, ids: &[Id]) {
        for &id in ids {
            let _ = self.delete_cell(id);
        }
    }

    /// Runs one backup cycle over every trunk and waits until the replica
    /// targets have applied it.
    pub async fn sync_trunks(&self) -> Result<()> {
        let Some(shipper) = &self.shipper else {
            return Ok(());
        };
        let mut updates = 0;
        for trunk in &self.trunks {
            updates += backup::sync_trunk(trunk, shipper).await?;
        }
        shipper.flush().await?;
        debug!(updates, "trunks synced");
        Ok(())
    }

    /// Imports any unimported replica directories under the backup root.
    /// Returns the number of cells installed.
    pub async fn recover_backups(&self) -> Result<usize> {
        let Some(root) = &self.config.backup_dir else {
            return Ok(0);
        };
        recovery::recover_from_root(&self.trunks, root, self.config.keep_imported_backup).await
    }

    pub fn stats(&self) -> Result<Vec<TrunkStats>> {
        self.trunks.iter().map(|trunk| trunk.stats()).collect()
    }

    #[cfg(test)]
    pub(crate) fn simulate_crash(&self) {
        for trunk in &self.trunks {
            trunk.clear_index();
        }
    }
}

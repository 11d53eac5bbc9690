//! The node-local schema table.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::schema::plan::{self, SchemaResolver};
use crate::schema::{CompiledSchema, Schema};

/// Maps schema id and name to compiled schemas.
///
/// Ids are assigned monotonically per node when a schema arrives without one.
/// The table persists to a bincode file at shutdown and loads it at cold
/// start; distributing schemas across the cluster is the registry's concern.
pub struct SchemaTable {
    by_id: RwLock<HashMap<u32, Arc<CompiledSchema>>>,
    name_to_id: RwLock<HashMap<String, u32>>,
    id_counter: AtomicU32,
}

impl SchemaTable {
    pub fn new() -> SchemaTable {
        SchemaTable {
            by_id: RwLock::new(HashMap::new()),
            name_to_id: RwLock::new(HashMap::new()),
            id_counter: AtomicU32::new(1),
        }
    }

    /// Registers a schema. An id of 0 means "assign one"; explicit ids come
    /// from the registry or the schema file. Returns the effective id.
    pub fn add(&self, mut schema: Schema) -> Result<u32> {
        if schema.id == 0 {
            schema.id = self.next_id();
        }
        let plan = plan::compile(&schema.fields, self)?;
        let id = schema.id;
        let mut by_id = self.by_id.write()?;
        let mut names = self.name_to_id.write()?;
        if by_id.contains_key(&id) || names.contains_key(&schema.name) {
            return Err(Error::AlreadyExists);
        }
        names.insert(schema.name.clone(), id);
        by_id.insert(id, Arc::new(CompiledSchema { schema, plan }));
        // Keep the counter ahead of explicit ids.
        self.id_counter.fetch_max(id + 1, Ordering::AcqRel);
        Ok(id)
    }

    pub fn remove(&self, id: u32) -> Result<()> {
        let mut by_id = self.by_id.write()?;
        let removed = by_id
            .remove(&id)
            .ok_or_else(|| Error::SchemaNotFound(format!("id {id}")))?;
        self.name_to_id.write()?.remove(&removed.schema.name);
        Ok(())
    }

    /// The schema by id, or the error the cell operations surface.
    pub fn get(&self, id: u32) -> Result<Arc<CompiledSchema>> {
        self.by_id
            .read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SchemaNotFound(format!("id {id}")))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<CompiledSchema>> {
        let id = self
            .id_of(name)?
            .ok_or_else(|| Error::SchemaNotFound(name.to_string()))?;
        self.get(id)
    }

    pub fn id_of(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.name_to_id.read()?.get(name).copied())
    }

    pub fn all(&self) -> Result<Vec<Schema>> {
        let mut schemas: Vec<Schema> = self
            .by_id
            .read()?
            .values()
            .map(|c| c.schema.clone())
            .collect();
        schemas.sort_by_key(|s| s.id);
        Ok(schemas)
    }

    fn next_id(&self) -> u32 {
        self.id_counter.fetch_add(1, Ordering::AcqRel)
    }

    /// Loads a schema file written by [`SchemaTable::save`]. Entries are
    /// added in file order so named references resolve.
    pub fn load(path: &Path) -> Result<SchemaTable> {
        let table = SchemaTable::new();
        let bytes = fs::read(path)?;
        let schemas: Vec<Schema> = bincode::deserialize(&bytes)?;
        for schema in schemas {
            table.add(schema)?;
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(&self.all()?)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

impl Default for SchemaTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaResolver for SchemaTable {
    fn resolve(&self, name: &str) -> Result<Option<u32>> {
        self.id_of(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, TypeExpr};
    use crate::tmpfs::TestDir;
    use crate::types::PrimType;

    fn point_schema() -> Schema {
        Schema::new(
            "point",
            vec![
                Field::prim("x", PrimType::Double),
                Field::prim("y", PrimType::Double),
            ],
        )
    }

    #[test]
    fn test_add_assigns_monotonic_ids() {
        let table = SchemaTable::new();
        let a = table.add(point_schema()).unwrap();
        let b = table.add(Schema::new("other", vec![])).unwrap();
        assert!(b > a);
        assert_eq!(table.id_of("point").unwrap(), Some(a));
        assert_eq!(table.get(a).unwrap().schema.name, "point");
    }

    #[test]
    fn test_explicit_id_bumps_counter() {
        let table = SchemaTable::new();
        table.add(Schema::new_with_id(10, "ten", vec![])).unwrap();
        let next = table.add(Schema::new("eleven", vec![])).unwrap();
        assert!(next > 10);
    }

    #[test]
    fn test_duplicate_rejected() {
        let table = SchemaTable::new();
        table.add(point_schema()).unwrap();
        assert_eq!(table.add(point_schema()), Err(Error::AlreadyExists));
    }

    #[test]
    fn test_remove() {
        let table = SchemaTable::new();
        let id = table.add(point_schema()).unwrap();
        table.remove(id).unwrap();
        assert!(table.get(id).is_err());
        assert!(table.id_of("point").unwrap().is_none());
        assert!(table.remove(id).is_err());
    }

    #[test]
    fn test_named_reference_resolves() {
        let table = SchemaTable::new();
        let point_id = table.add(point_schema()).unwrap();
        let line = Schema::new(
            "line",
            vec![
                Field::new("from", TypeExpr::Named("point".to_string())),
                Field::new("to", TypeExpr::Named("point".to_string())),
            ],
        );
        let line_id = table.add(line).unwrap();
        let compiled = table.get(line_id).unwrap();
        assert!(compiled
            .plan
            .ops
            .iter()
            .all(|op| matches!(op, crate::schema::WalkOp::SubSchema { id, .. } if *id == point_id)));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TestDir::new().unwrap();
        let path = dir.schema_file();

        let table = SchemaTable::new();
        table.add(point_schema()).unwrap();
        table
            .add(Schema::new(
                "line",
                vec![Field::new("from", TypeExpr::Named("point".to_string()))],
            ))
            .unwrap();
        table.save(&path).unwrap();

        let loaded = SchemaTable::load(&path).unwrap();
        assert_eq!(loaded.all().unwrap(), table.all().unwrap());
        assert_eq!(loaded.id_of("line").unwrap(), table.id_of("line").unwrap());
    }
}

//! The update-function registry.
//!
//! Update operations name their function by a registered symbol, so a
//! cluster peer can forward `update_cell(id, sym, args)` without shipping
//! code. Closures register at startup; nothing is loaded dynamically on the
//! hot path.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::types::Value;

/// An update function: current value and arguments to the new value.
pub type UpdateFn = dyn Fn(Value, &[Value]) -> Result<Value> + Send + Sync;

pub struct FuncRegistry {
    map: RwLock<HashMap<String, Arc<UpdateFn>>>,
}

impl FuncRegistry {
    pub fn new() -> FuncRegistry {
        FuncRegistry {
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `f` under `name`, replacing any previous registration.
    pub fn register<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: Fn(Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.map.write()?.insert(name.to_string(), Arc::new(f));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<UpdateFn>> {
        self.map
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))
    }
}

impl Default for FuncRegistry {
    fn default() -> Self {
        Self::new()
    }
}

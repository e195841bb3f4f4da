//! Module trait and registry.
//!
//! Each orchestration component is a [`Module`] owning a store-key
//! namespace. The [`ModuleRegistry`] holds modules in a configured order
//! and drives their begin/end-block hooks and genesis import/export; the
//! ordering is configuration, never derived.

use crate::store::{StateStore, StateView};
use crate::StoreError;
use atlas_types::Event;
use serde_json::Value;

/// A replicated orchestration component.
///
/// Default implementations make every hook optional; most modules only
/// implement genesis handling, while block-sweep components (health,
/// recovery) implement `end_block`.
pub trait Module {
    /// Stable module name; also the key of this module's genesis document.
    fn name(&self) -> &'static str;

    /// Hook run at the start of every block, before any input.
    fn begin_block(&mut self, state: &mut dyn StateView) -> Result<(), StoreError> {
        let _ = state;
        Ok(())
    }

    /// Hook run at the end of every block, after all inputs.
    fn end_block(&mut self, state: &mut dyn StateView) -> Result<Vec<Event>, StoreError> {
        let _ = state;
        Ok(Vec::new())
    }

    /// Load this module's slice of the genesis document.
    fn init_genesis(
        &mut self,
        state: &mut dyn StateView,
        genesis: &Value,
    ) -> Result<(), StoreError> {
        let _ = (state, genesis);
        Ok(())
    }

    /// Export this module's state as a genesis document.
    fn export_genesis(&self, store: &StateStore) -> Result<Value, StoreError> {
        let _ = store;
        Ok(Value::Null)
    }
}

/// Ordered collection of modules.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module. Registration order is begin/end-block order.
    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.push(module);
    }

    /// Names of all registered modules, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Run every module's begin-block hook.
    pub fn begin_block(&mut self, state: &mut dyn StateView) -> Result<(), StoreError> {
        for module in &mut self.modules {
            module.begin_block(state)?;
        }
        Ok(())
    }

    /// Run every module's end-block hook, collecting emitted events.
    pub fn end_block(&mut self, state: &mut dyn StateView) -> Result<Vec<Event>, StoreError> {
        let mut events = Vec::new();
        for module in &mut self.modules {
            events.extend(module.end_block(state)?);
        }
        Ok(events)
    }

    /// Feed each module its slice of `genesis` (an object keyed by module
    /// name). Missing slices are skipped.
    pub fn init_genesis(
        &mut self,
        state: &mut dyn StateView,
        genesis: &Value,
    ) -> Result<(), StoreError> {
        for module in &mut self.modules {
            if let Some(slice) = genesis.get(module.name()) {
                module.init_genesis(state, slice)?;
            }
        }
        Ok(())
    }

    /// Export all module states as one genesis object keyed by module name.
    pub fn export_genesis(&self, store: &StateStore) -> Result<Value, StoreError> {
        let mut doc = serde_json::Map::new();
        for module in &self.modules {
            let slice = module.export_genesis(store)?;
            if !slice.is_null() {
                doc.insert(module.name().to_string(), slice);
            }
        }
        Ok(Value::Object(doc))
    }
}

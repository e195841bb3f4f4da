//! Model registry.
//!
//! Versioned model artifacts (store namespace `model:`), identified by
//! `model-<name>-<version>`. Records are immutable apart from the explicit
//! version update path.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keys;
use atlas_state::{get_typed, set_typed, StateRead, StateStore, StateView, StoreError};
use atlas_types::Model;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Replicated model registry.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry;

impl ModelRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Register a model artifact under `model-<name>-<version>`.
    pub fn register_model<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        name: &str,
        version: &str,
        cid: &str,
        metadata: BTreeMap<String, String>,
    ) -> OrchestratorResult<Model> {
        if name.is_empty() || version.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "model name and version cannot be empty".to_string(),
            ));
        }
        if cid.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "model cid cannot be empty".to_string(),
            ));
        }

        let model_id = Model::model_id(name, version);
        if self.try_get_model(state, &model_id)?.is_some() {
            return Err(OrchestratorError::already_exists("model", &model_id));
        }

        let model = Model {
            id: model_id,
            name: name.to_string(),
            version: version.to_string(),
            cid: cid.to_string(),
            created_at_ns: state.ctx().block_time_ns,
            metadata,
        };
        self.set_model(state, &model)?;

        debug!(model_id = %model.id, cid = %model.cid, "Model registered");
        Ok(model)
    }

    /// Rewrite a model's version and artifact address in place.
    pub fn update_model_version<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        model_id: &str,
        new_version: &str,
        new_cid: &str,
    ) -> OrchestratorResult<Model> {
        if new_version.is_empty() || new_cid.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "model version and cid cannot be empty".to_string(),
            ));
        }

        let mut model = self.get_model(state, model_id)?;
        model.version = new_version.to_string();
        model.cid = new_cid.to_string();
        self.set_model(state, &model)?;
        Ok(model)
    }

    /// Fetch a model, failing with `NotFound` when absent.
    pub fn get_model<S: StateRead + ?Sized>(
        &self,
        state: &S,
        model_id: &str,
    ) -> OrchestratorResult<Model> {
        self.try_get_model(state, model_id)?
            .ok_or_else(|| OrchestratorError::not_found("model", model_id))
    }

    /// Fetch a model if present.
    pub fn try_get_model<S: StateRead + ?Sized>(
        &self,
        state: &S,
        model_id: &str,
    ) -> Result<Option<Model>, StoreError> {
        get_typed(state, &keys::model_key(model_id))
    }

    /// All models in id order.
    pub fn list_models<S: StateRead + ?Sized>(&self, state: &S) -> OrchestratorResult<Vec<Model>> {
        let mut models = Vec::new();
        for (_, bytes) in state.iter_prefix(keys::MODEL_PREFIX.as_bytes()) {
            models.push(atlas_state::decode(&bytes)?);
        }
        Ok(models)
    }

    /// All models whose artifact is `cid`.
    pub fn get_models_by_cid<S: StateRead + ?Sized>(
        &self,
        state: &S,
        cid: &str,
    ) -> OrchestratorResult<Vec<Model>> {
        Ok(self
            .list_models(state)?
            .into_iter()
            .filter(|model| model.cid == cid)
            .collect())
    }

    fn set_model<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        model: &Model,
    ) -> Result<(), StoreError> {
        set_typed(state, &keys::model_key(&model.id), model)
    }
}

impl atlas_state::Module for ModelRegistry {
    fn name(&self) -> &'static str {
        "model"
    }

    fn init_genesis(
        &mut self,
        state: &mut dyn StateView,
        genesis: &Value,
    ) -> Result<(), StoreError> {
        let models: Vec<Model> = serde_json::from_value(genesis.clone())
            .map_err(|e| StoreError::Genesis(e.to_string()))?;
        for model in &models {
            self.set_model(state, model)?;
        }
        Ok(())
    }

    fn export_genesis(&self, store: &StateStore) -> Result<Value, StoreError> {
        let mut models: Vec<Model> = Vec::new();
        for (_, bytes) in store.iter_prefix(keys::MODEL_PREFIX.as_bytes()) {
            models.push(atlas_state::decode(&bytes)?);
        }
        serde_json::to_value(models).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};

    #[test]
    fn test_register_id_format() {
        let registry = ModelRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 77));

        let model = registry
            .register_model(&mut scope, "resnet", "v1", "cid-m", BTreeMap::new())
            .unwrap();
        assert_eq!(model.id, "model-resnet-v1");
        assert_eq!(model.created_at_ns, 77);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = ModelRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        registry
            .register_model(&mut scope, "resnet", "v1", "cid-m", BTreeMap::new())
            .unwrap();
        let err = registry
            .register_model(&mut scope, "resnet", "v1", "cid-other", BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists { .. }));
    }

    #[test]
    fn test_update_version_rewrites_in_place() {
        let registry = ModelRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        registry
            .register_model(&mut scope, "resnet", "v1", "cid-1", BTreeMap::new())
            .unwrap();
        let updated = registry
            .update_model_version(&mut scope, "model-resnet-v1", "v2", "cid-2")
            .unwrap();
        assert_eq!(updated.id, "model-resnet-v1");
        assert_eq!(updated.version, "v2");
        assert_eq!(updated.cid, "cid-2");
    }

    #[test]
    fn test_lookup_by_cid() {
        let registry = ModelRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        registry
            .register_model(&mut scope, "a", "v1", "cid-shared", BTreeMap::new())
            .unwrap();
        registry
            .register_model(&mut scope, "b", "v1", "cid-shared", BTreeMap::new())
            .unwrap();
        registry
            .register_model(&mut scope, "c", "v1", "cid-own", BTreeMap::new())
            .unwrap();

        assert_eq!(
            registry
                .get_models_by_cid(&scope, "cid-shared")
                .unwrap()
                .len(),
            2
        );
    }
}

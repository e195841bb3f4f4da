//! Shard registry.
//!
//! Content-addressed dataset shards (store namespace `shard:`). A bound
//! shard only returns to the unbound pool through rollback.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keys;
use atlas_state::{get_typed, set_typed, StateRead, StateStore, StateView, StoreError};
use atlas_types::{Shard, ShardStatus};
use serde_json::Value;
use tracing::debug;

/// Replicated shard registry.
#[derive(Debug, Clone, Default)]
pub struct ShardRegistry;

impl ShardRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Register a shard record. Fails with `AlreadyExists` on id reuse.
    pub fn register_shard<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        shard: Shard,
    ) -> OrchestratorResult<Shard> {
        if shard.id.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "shard id cannot be empty".to_string(),
            ));
        }
        if shard.job_id.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "shard job id cannot be empty".to_string(),
            ));
        }
        if self.try_get_shard(state, &shard.id)?.is_some() {
            return Err(OrchestratorError::already_exists("shard", &shard.id));
        }

        self.set_shard(state, &shard)?;
        debug!(shard_id = %shard.id, job_id = %shard.job_id, "Shard registered");
        Ok(shard)
    }

    /// Bind a shard to a node.
    ///
    /// Re-binding to the same node is a no-op; binding to a different node
    /// fails with `AlreadyAssigned`.
    pub fn assign_shard_to_node<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        shard_id: &str,
        node_id: &str,
    ) -> OrchestratorResult<Shard> {
        let mut shard = self.get_shard(state, shard_id)?;
        if let Some(holder) = &shard.node_id {
            if holder != node_id {
                return Err(OrchestratorError::ShardAlreadyAssigned {
                    id: shard_id.to_string(),
                    holder: holder.clone(),
                });
            }
        }

        shard.node_id = Some(node_id.to_string());
        shard.status = ShardStatus::Assigned;
        self.set_shard(state, &shard)?;
        Ok(shard)
    }

    /// Return a shard to the unbound pool (rollback path).
    pub fn unbind_shard<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        shard_id: &str,
    ) -> OrchestratorResult<Shard> {
        let mut shard = self.get_shard(state, shard_id)?;
        shard.node_id = None;
        shard.status = ShardStatus::Pending;
        self.set_shard(state, &shard)?;
        Ok(shard)
    }

    /// Move a shard to a terminal status without touching its binding.
    pub fn mark_status<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        shard_id: &str,
        status: ShardStatus,
    ) -> OrchestratorResult<Shard> {
        let mut shard = self.get_shard(state, shard_id)?;
        shard.status = status;
        self.set_shard(state, &shard)?;
        Ok(shard)
    }

    /// Fetch a shard, failing with `NotFound` when absent.
    pub fn get_shard<S: StateRead + ?Sized>(
        &self,
        state: &S,
        shard_id: &str,
    ) -> OrchestratorResult<Shard> {
        self.try_get_shard(state, shard_id)?
            .ok_or_else(|| OrchestratorError::not_found("shard", shard_id))
    }

    /// Fetch a shard if present.
    pub fn try_get_shard<S: StateRead + ?Sized>(
        &self,
        state: &S,
        shard_id: &str,
    ) -> Result<Option<Shard>, StoreError> {
        get_typed(state, &keys::shard_key(shard_id))
    }

    /// All shards belonging to a job, in id order.
    pub fn get_shards_for_job<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
    ) -> OrchestratorResult<Vec<Shard>> {
        self.filter_shards(state, |shard| shard.job_id == job_id)
    }

    /// All shards bound to a node, in id order.
    pub fn get_shards_by_node<S: StateRead + ?Sized>(
        &self,
        state: &S,
        node_id: &str,
    ) -> OrchestratorResult<Vec<Shard>> {
        self.filter_shards(state, |shard| shard.is_assigned_to(node_id))
    }

    /// All shards carrying `hash`. The empty hash matches nothing.
    pub fn get_shards_by_hash<S: StateRead + ?Sized>(
        &self,
        state: &S,
        hash: &str,
    ) -> OrchestratorResult<Vec<Shard>> {
        if hash.is_empty() {
            return Ok(Vec::new());
        }
        self.filter_shards(state, |shard| shard.hash == hash)
    }

    fn filter_shards<S, F>(&self, state: &S, mut predicate: F) -> OrchestratorResult<Vec<Shard>>
    where
        S: StateRead + ?Sized,
        F: FnMut(&Shard) -> bool,
    {
        let mut shards = Vec::new();
        for (_, bytes) in state.iter_prefix(keys::SHARD_PREFIX.as_bytes()) {
            let shard: Shard = atlas_state::decode(&bytes)?;
            if predicate(&shard) {
                shards.push(shard);
            }
        }
        Ok(shards)
    }

    fn set_shard<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        shard: &Shard,
    ) -> Result<(), StoreError> {
        set_typed(state, &keys::shard_key(&shard.id), shard)
    }
}

impl atlas_state::Module for ShardRegistry {
    fn name(&self) -> &'static str {
        "sharding"
    }

    fn init_genesis(
        &mut self,
        state: &mut dyn StateView,
        genesis: &Value,
    ) -> Result<(), StoreError> {
        let shards: Vec<Shard> = serde_json::from_value(genesis.clone())
            .map_err(|e| StoreError::Genesis(e.to_string()))?;
        for shard in &shards {
            self.set_shard(state, shard)?;
        }
        Ok(())
    }

    fn export_genesis(&self, store: &StateStore) -> Result<Value, StoreError> {
        let mut shards: Vec<Shard> = Vec::new();
        for (_, bytes) in store.iter_prefix(keys::SHARD_PREFIX.as_bytes()) {
            shards.push(atlas_state::decode(&bytes)?);
        }
        serde_json::to_value(shards).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};

    fn shard(id: &str, job: &str, hash: &str) -> Shard {
        Shard {
            id: id.to_string(),
            job_id: job.to_string(),
            cid: format!("cid-{id}"),
            hash: hash.to_string(),
            node_id: None,
            status: ShardStatus::Pending,
            size: 1024,
        }
    }

    #[test]
    fn test_register_and_duplicate() {
        let registry = ShardRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        registry
            .register_shard(&mut scope, shard("s1", "job-1", "h1"))
            .unwrap();
        let err = registry
            .register_shard(&mut scope, shard("s1", "job-1", "h1"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists { .. }));
    }

    #[test]
    fn test_assignment_rules() {
        let registry = ShardRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));
        registry
            .register_shard(&mut scope, shard("s1", "job-1", "h1"))
            .unwrap();

        let assigned = registry
            .assign_shard_to_node(&mut scope, "s1", "n1")
            .unwrap();
        assert_eq!(assigned.node_id.as_deref(), Some("n1"));
        assert_eq!(assigned.status, ShardStatus::Assigned);

        // Same node again: fine.
        registry
            .assign_shard_to_node(&mut scope, "s1", "n1")
            .unwrap();

        // Different node: rejected.
        let err = registry
            .assign_shard_to_node(&mut scope, "s1", "n2")
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ShardAlreadyAssigned { .. }
        ));

        // Rollback frees the shard for a different node.
        let unbound = registry.unbind_shard(&mut scope, "s1").unwrap();
        assert_eq!(unbound.node_id, None);
        assert_eq!(unbound.status, ShardStatus::Pending);
        registry
            .assign_shard_to_node(&mut scope, "s1", "n2")
            .unwrap();
    }

    #[test]
    fn test_lookups() {
        let registry = ShardRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        registry
            .register_shard(&mut scope, shard("s1", "job-1", "h1"))
            .unwrap();
        registry
            .register_shard(&mut scope, shard("s2", "job-1", "h2"))
            .unwrap();
        registry
            .register_shard(&mut scope, shard("s3", "job-2", "h1"))
            .unwrap();
        registry
            .assign_shard_to_node(&mut scope, "s1", "n1")
            .unwrap();

        assert_eq!(registry.get_shards_for_job(&scope, "job-1").unwrap().len(), 2);
        assert_eq!(registry.get_shards_by_node(&scope, "n1").unwrap().len(), 1);
        assert_eq!(registry.get_shards_by_hash(&scope, "h1").unwrap().len(), 2);
        assert!(registry.get_shards_by_hash(&scope, "").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_shard() {
        let registry = ShardRegistry::new();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let err = registry
            .assign_shard_to_node(&mut scope, "ghost", "n1")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }
}

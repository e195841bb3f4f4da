//! Assignment validator.
//!
//! Pre-assignment predicates over shards and tasks. The validator owns no
//! store namespace; it borrows read capabilities from the shard, task and
//! node registries and the health monitor.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::health::HealthMonitor;
use crate::jobs::JobEngine;
use crate::nodes::NodeRegistry;
use crate::shards::ShardRegistry;
use atlas_state::{StateRead, StateView};
use atlas_types::OrchestratorConfig;

/// Validates shard and task assignments before they are bound.
#[derive(Debug, Clone)]
pub struct AssignmentValidator {
    config: OrchestratorConfig,
    nodes: NodeRegistry,
    shards: ShardRegistry,
    jobs: JobEngine,
    health: HealthMonitor,
}

impl AssignmentValidator {
    pub fn new(
        config: OrchestratorConfig,
        nodes: NodeRegistry,
        shards: ShardRegistry,
        jobs: JobEngine,
        health: HealthMonitor,
    ) -> Self {
        Self {
            config,
            nodes,
            shards,
            jobs,
            health,
        }
    }

    /// Validate binding `shard_id` to `node_id`.
    ///
    /// Succeeds iff the shard exists, is unassigned or already bound to
    /// this node, and no other shard held by the node carries the same
    /// non-empty content hash.
    pub fn validate_shard_assignment<S: StateRead + ?Sized>(
        &self,
        state: &S,
        shard_id: &str,
        node_id: &str,
    ) -> OrchestratorResult<()> {
        let shard = self.shards.get_shard(state, shard_id)?;

        if let Some(holder) = &shard.node_id {
            if holder != node_id {
                return Err(OrchestratorError::ShardAlreadyAssigned {
                    id: shard_id.to_string(),
                    holder: holder.clone(),
                });
            }
        }

        if !shard.hash.is_empty() {
            for held in self.shards.get_shards_by_node(state, node_id)? {
                if held.id != shard.id && held.hash == shard.hash {
                    return Err(OrchestratorError::DuplicateShardContent {
                        node_id: node_id.to_string(),
                        hash: shard.hash.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Whether any shard already carries `hash`. The empty hash is never a
    /// duplicate.
    pub fn check_duplicate_shard<S: StateRead + ?Sized>(
        &self,
        state: &S,
        hash: &str,
    ) -> OrchestratorResult<bool> {
        if hash.is_empty() {
            return Ok(false);
        }
        Ok(!self.shards.get_shards_by_hash(state, hash)?.is_empty())
    }

    /// Validate binding `task_id` to `node_id`: the task exists and is not
    /// bound elsewhere, the node exists, is online, passes the health
    /// check, and has spare capacity.
    pub fn validate_task_assignment<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        task_id: &str,
        node_id: &str,
    ) -> OrchestratorResult<()> {
        let task = self.jobs.get_task(state, task_id)?;
        if let Some(holder) = &task.node_id {
            if holder != node_id {
                return Err(OrchestratorError::TaskAlreadyAssigned {
                    id: task_id.to_string(),
                    holder: holder.clone(),
                });
            }
        }

        let node = self.nodes.get_node(state, node_id)?;
        if !node.is_online() {
            return Err(OrchestratorError::NodeOffline(node_id.to_string()));
        }
        if !self.health.check_node_health(state, node_id)? {
            return Err(OrchestratorError::NodeUnhealthy(node_id.to_string()));
        }
        if !node.has_capacity(self.config.max_tasks_per_node) {
            return Err(OrchestratorError::NodeAtCapacity(node_id.to_string()));
        }

        Ok(())
    }
}

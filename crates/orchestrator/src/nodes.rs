//! Node registry.
//!
//! Tracks node identities, declared resources, liveness and reputation.
//! Nodes are keyed by id and never deleted; deregistration flips them
//! offline and clears their active task set.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keys;
use atlas_state::{get_typed, set_typed, StateRead, StateStore, StateView, StoreError};
use atlas_types::{Node, NodeResources, NodeStatus, OrchestratorConfig};
use serde_json::Value;
use tracing::debug;

/// Replicated node registry (store namespace `node:`).
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    config: OrchestratorConfig,
}

impl NodeRegistry {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Register a new node. Fails with `AlreadyExists` when the id is taken.
    pub fn register_node<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
        address: &str,
        resources: NodeResources,
    ) -> OrchestratorResult<Node> {
        if node_id.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "node id cannot be empty".to_string(),
            ));
        }
        if address.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "node address cannot be empty".to_string(),
            ));
        }
        if self.try_get_node(state, node_id)?.is_some() {
            return Err(OrchestratorError::already_exists("node", node_id));
        }

        let now = state.ctx().block_time_ns;
        let node = Node {
            id: node_id.to_string(),
            address: address.to_string(),
            status: NodeStatus::Online,
            resources,
            reputation: 0.0,
            uptime_percent: 0.0,
            last_heartbeat_ns: now,
            registered_at_ns: now,
            active_tasks: Vec::new(),
        };
        self.set_node(state, &node)?;

        debug!(node_id = %node.id, address = %node.address, "Node registered");
        Ok(node)
    }

    /// Record a heartbeat: refresh the clock and force the node online.
    pub fn heartbeat<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
    ) -> OrchestratorResult<Node> {
        let mut node = self.get_node(state, node_id)?;
        node.last_heartbeat_ns = state.ctx().block_time_ns;
        node.status = NodeStatus::Online;
        self.set_node(state, &node)?;
        Ok(node)
    }

    /// Set uptime and derive reputation, halving it below the penalty
    /// threshold.
    pub fn update_reputation<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
        uptime_percent: f64,
    ) -> OrchestratorResult<Node> {
        if !(0.0..=100.0).contains(&uptime_percent) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "uptime_percent out of range: {uptime_percent}"
            )));
        }

        let mut node = self.get_node(state, node_id)?;
        node.uptime_percent = uptime_percent;
        node.reputation = if uptime_percent < self.config.reputation_penalty_threshold {
            uptime_percent * 0.5
        } else {
            uptime_percent
        };
        self.set_node(state, &node)?;

        debug!(
            node_id = %node.id,
            uptime = node.uptime_percent,
            reputation = node.reputation,
            "Reputation updated"
        );
        Ok(node)
    }

    /// Take a node out of the fleet: offline, no active tasks. The record
    /// itself is retained.
    pub fn deregister_node<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
    ) -> OrchestratorResult<Node> {
        let mut node = self.get_node(state, node_id)?;
        node.status = NodeStatus::Offline;
        node.active_tasks.clear();
        self.set_node(state, &node)?;
        Ok(node)
    }

    /// Fetch a node, failing with `NotFound` when absent.
    pub fn get_node<S: StateRead + ?Sized>(
        &self,
        state: &S,
        node_id: &str,
    ) -> OrchestratorResult<Node> {
        self.try_get_node(state, node_id)?
            .ok_or_else(|| OrchestratorError::not_found("node", node_id))
    }

    /// Fetch a node if present.
    pub fn try_get_node<S: StateRead + ?Sized>(
        &self,
        state: &S,
        node_id: &str,
    ) -> Result<Option<Node>, StoreError> {
        get_typed(state, &keys::node_key(node_id))
    }

    /// All nodes in deterministic id order.
    pub fn list_nodes<S: StateRead + ?Sized>(&self, state: &S) -> OrchestratorResult<Vec<Node>> {
        let mut nodes = Vec::new();
        for (_, bytes) in state.iter_prefix(keys::NODE_PREFIX.as_bytes()) {
            nodes.push(atlas_state::decode(&bytes)?);
        }
        Ok(nodes)
    }

    /// Visit nodes in id order until the handler returns `true`.
    pub fn iterate_nodes<S, F>(&self, state: &S, mut handler: F) -> OrchestratorResult<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(&Node) -> bool,
    {
        for (_, bytes) in state.iter_prefix(keys::NODE_PREFIX.as_bytes()) {
            let node: Node = atlas_state::decode(&bytes)?;
            if handler(&node) {
                break;
            }
        }
        Ok(())
    }

    /// Bind a task to the node's active set, enforcing the capacity cap.
    pub fn add_active_task<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
        task_id: &str,
    ) -> OrchestratorResult<Node> {
        let mut node = self.get_node(state, node_id)?;
        if !node.has_capacity(self.config.max_tasks_per_node) {
            return Err(OrchestratorError::NodeAtCapacity(node_id.to_string()));
        }
        if !node.active_tasks.iter().any(|id| id == task_id) {
            node.active_tasks.push(task_id.to_string());
        }
        self.set_node(state, &node)?;
        Ok(node)
    }

    /// Drop a task from the node's active set, if present.
    pub fn remove_active_task<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
        task_id: &str,
    ) -> OrchestratorResult<()> {
        let Some(mut node) = self.try_get_node(state, node_id)? else {
            return Ok(());
        };
        node.active_tasks.retain(|id| id != task_id);
        self.set_node(state, &node)?;
        Ok(())
    }

    /// Persist a node record.
    pub fn set_node<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node: &Node,
    ) -> Result<(), StoreError> {
        set_typed(state, &keys::node_key(&node.id), node)
    }
}

impl atlas_state::Module for NodeRegistry {
    fn name(&self) -> &'static str {
        "compute"
    }

    fn init_genesis(
        &mut self,
        state: &mut dyn StateView,
        genesis: &Value,
    ) -> Result<(), StoreError> {
        let nodes: Vec<Node> = serde_json::from_value(genesis.clone())
            .map_err(|e| StoreError::Genesis(e.to_string()))?;
        for node in &nodes {
            self.set_node(state, node)?;
        }
        Ok(())
    }

    fn export_genesis(&self, store: &StateStore) -> Result<Value, StoreError> {
        let mut nodes: Vec<Node> = Vec::new();
        for (_, bytes) in store.iter_prefix(keys::NODE_PREFIX.as_bytes()) {
            nodes.push(atlas_state::decode(&bytes)?);
        }
        serde_json::to_value(nodes).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

//! Health monitor.
//!
//! Watches node heartbeats against block time. The end-of-block sweep
//! flips overdue nodes offline and emits `node_offline` events for the
//! recovery coordinator.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::nodes::NodeRegistry;
use atlas_state::{StateView, StoreError};
use atlas_types::{Event, NodeStatus, OrchestratorConfig};
use tracing::{debug, warn};

/// Liveness sweep over the node registry.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: OrchestratorConfig,
    nodes: NodeRegistry,
}

impl HealthMonitor {
    pub fn new(config: OrchestratorConfig, nodes: NodeRegistry) -> Self {
        Self { config, nodes }
    }

    /// Check one node's heartbeat.
    ///
    /// Returns `Ok(true)` when the node is within the timeout. When the
    /// heartbeat is overdue the offline transition is persisted and
    /// `Ok(false)` is returned. Unknown nodes fail with `NotFound`.
    pub fn check_node_health<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
    ) -> OrchestratorResult<bool> {
        let mut node = self.nodes.get_node(state, node_id)?;

        let now = state.ctx().block_time_ns;
        let elapsed = now.saturating_sub(node.last_heartbeat_ns);
        if elapsed > self.config.heartbeat_timeout_ns() {
            if node.status == NodeStatus::Online {
                node.status = NodeStatus::Offline;
                self.nodes.set_node(state, &node)?;
            }
            return Ok(false);
        }
        Ok(true)
    }

    /// Mark every overdue node offline, emitting `node_offline` for each
    /// node that was online before the sweep.
    pub fn sweep<S: StateView + ?Sized>(&self, state: &mut S) -> OrchestratorResult<Vec<Event>> {
        let now = state.ctx().block_time_ns;
        let timeout = self.config.heartbeat_timeout_ns();

        let mut events = Vec::new();
        for mut node in self.nodes.list_nodes(state)? {
            let elapsed = now.saturating_sub(node.last_heartbeat_ns);
            if elapsed > timeout && node.status == NodeStatus::Online {
                warn!(
                    node_id = %node.id,
                    elapsed_ns = elapsed,
                    "Node missed heartbeat deadline, marking offline"
                );
                node.status = NodeStatus::Offline;
                self.nodes.set_node(state, &node)?;
                events.push(Event::NodeOffline { node_id: node.id });
            }
        }

        if !events.is_empty() {
            debug!(offline = events.len(), "Health sweep finished");
        }
        Ok(events)
    }

    /// Nodes currently past the heartbeat deadline, without mutating state.
    pub fn offline_candidates<S: StateView + ?Sized>(
        &self,
        state: &S,
    ) -> OrchestratorResult<Vec<String>> {
        let now = state.ctx().block_time_ns;
        let timeout = self.config.heartbeat_timeout_ns();
        Ok(self
            .nodes
            .list_nodes(state)?
            .into_iter()
            .filter(|node| now.saturating_sub(node.last_heartbeat_ns) > timeout)
            .map(|node| node.id)
            .collect())
    }
}

impl atlas_state::Module for HealthMonitor {
    fn name(&self) -> &'static str {
        "health"
    }

    fn end_block(&mut self, state: &mut dyn StateView) -> Result<Vec<Event>, StoreError> {
        // Health errors other than store failures cannot occur here; any
        // decode failure is corruption and must abort the block.
        match self.sweep(state) {
            Ok(events) => Ok(events),
            Err(OrchestratorError::Store(e)) => Err(e),
            Err(other) => Err(StoreError::Codec(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};
    use atlas_types::NodeResources;

    const SECOND_NS: u64 = 1_000_000_000;

    fn setup() -> (StateStore, NodeRegistry, HealthMonitor) {
        let config = OrchestratorConfig::default();
        let nodes = NodeRegistry::new(config.clone());
        let health = HealthMonitor::new(config, nodes.clone());
        (StateStore::new(), nodes, health)
    }

    fn register(store: &mut StateStore, nodes: &NodeRegistry, id: &str, at_ns: u64) {
        let mut scope = store.begin_block(BlockContext::new(1, at_ns));
        nodes
            .register_node(&mut scope, id, "addr", NodeResources::default())
            .unwrap();
        scope.commit();
    }

    #[test]
    fn test_within_timeout_is_healthy() {
        let (mut store, nodes, health) = setup();
        register(&mut store, &nodes, "n1", 0);

        let mut scope = store.begin_block(BlockContext::new(2, 90 * SECOND_NS));
        assert!(health.check_node_health(&mut scope, "n1").unwrap());
        assert_eq!(
            nodes.get_node(&scope, "n1").unwrap().status,
            NodeStatus::Online
        );
    }

    #[test]
    fn test_past_timeout_goes_offline() {
        let (mut store, nodes, health) = setup();
        register(&mut store, &nodes, "n1", 0);

        let mut scope = store.begin_block(BlockContext::new(2, 91 * SECOND_NS));
        assert!(!health.check_node_health(&mut scope, "n1").unwrap());
        assert_eq!(
            nodes.get_node(&scope, "n1").unwrap().status,
            NodeStatus::Offline
        );
    }

    #[test]
    fn test_unknown_node_not_found() {
        let (mut store, _nodes, health) = setup();
        let mut scope = store.begin_block(BlockContext::new(1, 0));
        let err = health.check_node_health(&mut scope, "ghost").unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[test]
    fn test_sweep_emits_once_per_node() {
        let (mut store, nodes, health) = setup();
        register(&mut store, &nodes, "n1", 0);
        register(&mut store, &nodes, "n2", 0);

        let mut scope = store.begin_block(BlockContext::new(2, 120 * SECOND_NS));
        let events = health.sweep(&mut scope).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, Event::NodeOffline { .. })));

        // Second sweep in the same conditions: nodes already offline, no
        // further events.
        let events = health.sweep(&mut scope).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_heartbeat_resets_the_clock() {
        let (mut store, nodes, health) = setup();
        register(&mut store, &nodes, "n1", 0);

        let mut scope = store.begin_block(BlockContext::new(2, 80 * SECOND_NS));
        nodes.heartbeat(&mut scope, "n1").unwrap();
        scope.commit();

        let mut scope = store.begin_block(BlockContext::new(3, 150 * SECOND_NS));
        let events = health.sweep(&mut scope).unwrap();
        assert!(events.is_empty());
    }
}

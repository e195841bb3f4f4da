//! Scheduler.
//!
//! Picks a node for pending work. Candidates are online nodes with spare
//! capacity, in deterministic id order; strategy selection is a pure
//! function of replicated state (the round-robin cursor itself is state).

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keys;
use crate::nodes::NodeRegistry;
use atlas_state::{StateRead, StateView};
use atlas_types::{Node, OrchestratorConfig, SchedulerStrategy};
use tracing::debug;

/// Deterministic node selection over the registry.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: OrchestratorConfig,
    nodes: NodeRegistry,
}

impl Scheduler {
    pub fn new(config: OrchestratorConfig, nodes: NodeRegistry) -> Self {
        Self { config, nodes }
    }

    /// The candidate set: online nodes below the task cap, in id order.
    pub fn candidates<S: StateRead + ?Sized>(&self, state: &S) -> OrchestratorResult<Vec<Node>> {
        Ok(self
            .nodes
            .list_nodes(state)?
            .into_iter()
            .filter(|node| node.is_online() && node.has_capacity(self.config.max_tasks_per_node))
            .collect())
    }

    /// Pick a node with the configured strategy.
    pub fn select_node<S: StateView + ?Sized>(&self, state: &mut S) -> OrchestratorResult<String> {
        self.select_node_with(state, self.config.scheduler_strategy)
    }

    /// Pick a node with an explicit strategy.
    pub fn select_node_with<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        strategy: SchedulerStrategy,
    ) -> OrchestratorResult<String> {
        let candidates = self.candidates(state)?;
        if candidates.is_empty() {
            return Err(OrchestratorError::NoNodesAvailable);
        }

        let selected = match strategy {
            SchedulerStrategy::RoundRobin => self.select_round_robin(state, &candidates),
            SchedulerStrategy::LeastLoaded => Ok(Self::select_least_loaded(&candidates)),
            SchedulerStrategy::BestReputation => Ok(Self::select_best_reputation(&candidates)),
        }?;

        debug!(node_id = %selected, strategy = %strategy, "Node selected");
        Ok(selected)
    }

    fn select_round_robin<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        candidates: &[Node],
    ) -> OrchestratorResult<String> {
        let index = match state.get(keys::ROUND_ROBIN_INDEX_KEY) {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    OrchestratorError::Store(atlas_state::StoreError::Codec(
                        "round_robin_index is not a u64".to_string(),
                    ))
                })?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };

        let selected = &candidates[(index % candidates.len() as u64) as usize];
        state.set(
            keys::ROUND_ROBIN_INDEX_KEY,
            (index + 1).to_be_bytes().to_vec(),
        );
        Ok(selected.id.clone())
    }

    fn select_least_loaded(candidates: &[Node]) -> String {
        // Candidates are id-ordered, so a strict comparison breaks ties
        // toward the lower id.
        let mut best = &candidates[0];
        for node in &candidates[1..] {
            if node.active_tasks.len() < best.active_tasks.len() {
                best = node;
            }
        }
        best.id.clone()
    }

    fn select_best_reputation(candidates: &[Node]) -> String {
        let mut best = &candidates[0];
        for node in &candidates[1..] {
            if node.reputation > best.reputation {
                best = node;
            }
        }
        best.id.clone()
    }

    /// Bump the per-node per-model request counter.
    pub fn record_request<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
        model_id: &str,
    ) {
        let key = keys::sched_request_key(node_id, model_id);
        let count = match state.get(&key) {
            Some(bytes) => bytes
                .as_slice()
                .try_into()
                .map(u64::from_be_bytes)
                .unwrap_or(0),
            None => 0,
        };
        state.set(&key, (count + 1).to_be_bytes().to_vec());
    }

    /// Read the per-node per-model request counter.
    pub fn request_count<S: StateRead + ?Sized>(
        &self,
        state: &S,
        node_id: &str,
        model_id: &str,
    ) -> u64 {
        state
            .get(&keys::sched_request_key(node_id, model_id))
            .and_then(|bytes| bytes.as_slice().try_into().ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};
    use atlas_types::NodeResources;

    fn setup(strategy: SchedulerStrategy) -> (StateStore, NodeRegistry, Scheduler) {
        let config = OrchestratorConfig {
            scheduler_strategy: strategy,
            ..OrchestratorConfig::default()
        };
        let nodes = NodeRegistry::new(config.clone());
        let scheduler = Scheduler::new(config, nodes.clone());
        (StateStore::new(), nodes, scheduler)
    }

    fn register_three(store: &mut StateStore, nodes: &NodeRegistry) {
        let mut scope = store.begin_block(BlockContext::new(1, 0));
        for id in ["n1", "n2", "n3"] {
            nodes
                .register_node(&mut scope, id, "addr", NodeResources::default())
                .unwrap();
        }
        scope.commit();
    }

    #[test]
    fn test_round_robin_cycles_deterministically() {
        let (mut store, nodes, scheduler) = setup(SchedulerStrategy::RoundRobin);
        register_three(&mut store, &nodes);

        let mut scope = store.begin_block(BlockContext::new(2, 0));
        let picks: Vec<String> = (0..4)
            .map(|_| scheduler.select_node(&mut scope).unwrap())
            .collect();
        assert_eq!(picks, vec!["n1", "n2", "n3", "n1"]);
    }

    #[test]
    fn test_round_robin_index_persists_across_blocks() {
        let (mut store, nodes, scheduler) = setup(SchedulerStrategy::RoundRobin);
        register_three(&mut store, &nodes);

        let mut scope = store.begin_block(BlockContext::new(2, 0));
        assert_eq!(scheduler.select_node(&mut scope).unwrap(), "n1");
        scope.commit();

        let mut scope = store.begin_block(BlockContext::new(3, 0));
        assert_eq!(scheduler.select_node(&mut scope).unwrap(), "n2");
    }

    #[test]
    fn test_least_loaded_with_tie_break() {
        let (mut store, nodes, scheduler) = setup(SchedulerStrategy::LeastLoaded);
        register_three(&mut store, &nodes);

        let mut scope = store.begin_block(BlockContext::new(2, 0));
        nodes.add_active_task(&mut scope, "n1", "t1").unwrap();

        // n2 and n3 both have zero tasks: lower id wins.
        assert_eq!(scheduler.select_node(&mut scope).unwrap(), "n2");
    }

    #[test]
    fn test_best_reputation_with_tie_break() {
        let (mut store, nodes, scheduler) = setup(SchedulerStrategy::BestReputation);
        register_three(&mut store, &nodes);

        let mut scope = store.begin_block(BlockContext::new(2, 0));
        nodes.update_reputation(&mut scope, "n2", 80.0).unwrap();
        nodes.update_reputation(&mut scope, "n3", 80.0).unwrap();

        assert_eq!(scheduler.select_node(&mut scope).unwrap(), "n2");
    }

    #[test]
    fn test_offline_and_full_nodes_excluded() {
        let (mut store, nodes, scheduler) = setup(SchedulerStrategy::RoundRobin);
        register_three(&mut store, &nodes);

        let mut scope = store.begin_block(BlockContext::new(2, 0));
        nodes.deregister_node(&mut scope, "n1").unwrap();
        for i in 0..10 {
            nodes
                .add_active_task(&mut scope, "n2", &format!("t{i}"))
                .unwrap();
        }

        let candidates = scheduler.candidates(&scope).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "n3");
    }

    #[test]
    fn test_no_nodes_available() {
        let (mut store, _nodes, scheduler) = setup(SchedulerStrategy::RoundRobin);
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let err = scheduler.select_node(&mut scope).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoNodesAvailable));
    }

    #[test]
    fn test_request_counter() {
        let (mut store, _nodes, scheduler) = setup(SchedulerStrategy::RoundRobin);
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        assert_eq!(scheduler.request_count(&scope, "n1", "m1"), 0);
        scheduler.record_request(&mut scope, "n1", "m1");
        scheduler.record_request(&mut scope, "n1", "m1");
        assert_eq!(scheduler.request_count(&scope, "n1", "m1"), 2);
    }
}

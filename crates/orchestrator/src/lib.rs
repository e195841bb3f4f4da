//! Replicated orchestration state machine for the Atlas compute fleet.
//!
//! The [`Orchestrator`] owns the state store and one instance of every
//! replicated component: node registry, shard registry, model registry,
//! job/task engine, assignment validator, scheduler, health monitor,
//! recovery coordinator, contribution ledger and reward engine.
//!
//! Inputs arrive as ordered [`Transaction`]s grouped into blocks; the
//! surrounding consensus layer decides the order, this crate decides the
//! effects. Each transaction applies atomically (a failed one leaves no
//! trace), each block commits atomically, and the end-of-block sweep runs
//! the health monitor and routes `node_offline` events into recovery.

pub mod error;
pub mod health;
pub mod jobs;
pub mod keys;
pub mod models;
pub mod nodes;
pub mod recovery;
pub mod rewards;
pub mod scheduler;
pub mod shards;
pub mod validation;

pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use health::HealthMonitor;
pub use jobs::JobEngine;
pub use models::ModelRegistry;
pub use nodes::NodeRegistry;
pub use recovery::RecoveryCoordinator;
pub use rewards::{
    Bank, BankError, ContributionLedger, MemoryBank, RewardEngine, SharedBank,
    REWARD_POOL_ADDRESS,
};
pub use scheduler::Scheduler;
pub use shards::ShardRegistry;
pub use validation::AssignmentValidator;

use atlas_state::{get_typed, set_typed, BlockContext, ModuleRegistry, StateRead, StateStore, StateView};
use atlas_types::{
    Event, GradientContribution, Job, Model, Node, NodeResources, OrchestratorConfig, Shard,
    ShardStatus, Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// An ordered input to the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transaction {
    RegisterNode {
        node_id: String,
        address: String,
        resources: NodeResources,
    },
    UpdateHeartbeat {
        node_id: String,
    },
    UpdateReputation {
        node_id: String,
        uptime_percent: f64,
    },
    DeregisterNode {
        node_id: String,
    },
    RegisterModel {
        name: String,
        version: String,
        cid: String,
        metadata: BTreeMap<String, String>,
    },
    UpdateModelVersion {
        model_id: String,
        version: String,
        cid: String,
    },
    SubmitJob {
        model_id: String,
        dataset_cid: String,
        config: BTreeMap<String, String>,
    },
    RegisterShard {
        shard_id: String,
        job_id: String,
        cid: String,
        hash: String,
        size: u64,
    },
    CreateTask {
        job_id: String,
        shard_id: String,
        node_id: Option<String>,
    },
    UpdateTaskStatus {
        task_id: String,
        status: String,
        progress: Option<f64>,
        checkpoint_cid: Option<String>,
    },
    /// Assign every unbound pending task of a job via the scheduler.
    DispatchJob {
        job_id: String,
    },
    SubmitGradient {
        job_id: String,
        round: u64,
        node_id: String,
        gradient_cid: String,
        contribution_weight: f64,
    },
    /// Advance a job's round counter after aggregation.
    CompleteRound {
        job_id: String,
        round: u64,
        aggregate_cid: String,
    },
    /// Pay fair-share rewards for a completed round.
    DistributeRoundRewards {
        job_id: String,
        round: u64,
        base_reward: u128,
    },
    /// Mark a job failed (failed round path).
    FailJob {
        job_id: String,
    },
}

/// Result of one applied transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxReceipt {
    /// Id of the entity the transaction created, if any.
    pub entity_id: Option<String>,
}

impl TxReceipt {
    fn created(id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(id.into()),
        }
    }
}

/// Outcome of applying one block of transactions.
#[derive(Debug)]
pub struct BlockOutcome {
    /// Block height.
    pub height: u64,
    /// Events emitted by successful transactions and the end-block sweep.
    pub events: Vec<Event>,
    /// Per-transaction results, in input order.
    pub results: Vec<OrchestratorResult<TxReceipt>>,
}

/// The stateless component handles, grouped so the block loop can borrow
/// them alongside the store.
struct Components {
    config: OrchestratorConfig,
    nodes: NodeRegistry,
    shards: ShardRegistry,
    models: ModelRegistry,
    jobs: JobEngine,
    health: HealthMonitor,
    validator: AssignmentValidator,
    scheduler: Scheduler,
    recovery: RecoveryCoordinator,
    contributions: ContributionLedger,
    rewards: RewardEngine,
}

impl Components {
    fn new(config: OrchestratorConfig) -> Self {
        let nodes = NodeRegistry::new(config.clone());
        let shards = ShardRegistry::new();
        let models = ModelRegistry::new();
        let jobs = JobEngine::new();
        let health = HealthMonitor::new(config.clone(), nodes.clone());
        let validator = AssignmentValidator::new(
            config.clone(),
            nodes.clone(),
            shards.clone(),
            jobs.clone(),
            health.clone(),
        );
        let scheduler = Scheduler::new(config.clone(), nodes.clone());
        let recovery = RecoveryCoordinator::new(
            nodes.clone(),
            jobs.clone(),
            shards.clone(),
            health.clone(),
            validator.clone(),
        );
        let contributions = ContributionLedger::new();
        let rewards = RewardEngine::new(nodes.clone());
        Self {
            config,
            nodes,
            shards,
            models,
            jobs,
            health,
            validator,
            scheduler,
            recovery,
            contributions,
            rewards,
        }
    }

    fn current_round<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
    ) -> OrchestratorResult<u64> {
        Ok(get_typed(state, &keys::round_key(job_id))?.unwrap_or(0))
    }

    fn apply_tx<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        bank: &mut dyn Bank,
        tx: Transaction,
    ) -> OrchestratorResult<(TxReceipt, Vec<Event>)> {
        match tx {
            Transaction::RegisterNode {
                node_id,
                address,
                resources,
            } => {
                let node = self
                    .nodes
                    .register_node(state, &node_id, &address, resources)?;
                let event = Event::NodeRegistered {
                    node_id: node.id.clone(),
                    address: node.address,
                };
                Ok((TxReceipt::created(node.id), vec![event]))
            }
            Transaction::UpdateHeartbeat { node_id } => {
                self.nodes.heartbeat(state, &node_id)?;
                Ok((TxReceipt::default(), Vec::new()))
            }
            Transaction::UpdateReputation {
                node_id,
                uptime_percent,
            } => {
                self.nodes
                    .update_reputation(state, &node_id, uptime_percent)?;
                Ok((TxReceipt::default(), Vec::new()))
            }
            Transaction::DeregisterNode { node_id } => {
                // Unbind the node's work first so task and shard records
                // stay consistent with the cleared active set.
                let events = self.recovery.rollback_tasks_for_node(state, &node_id)?;
                self.nodes.deregister_node(state, &node_id)?;
                Ok((TxReceipt::default(), events))
            }
            Transaction::RegisterModel {
                name,
                version,
                cid,
                metadata,
            } => {
                let model = self
                    .models
                    .register_model(state, &name, &version, &cid, metadata)?;
                let event = Event::ModelRegistered {
                    model_id: model.id.clone(),
                    name: model.name.clone(),
                    version: model.version.clone(),
                };
                Ok((TxReceipt::created(model.id), vec![event]))
            }
            Transaction::UpdateModelVersion {
                model_id,
                version,
                cid,
            } => {
                self.models
                    .update_model_version(state, &model_id, &version, &cid)?;
                Ok((TxReceipt::default(), Vec::new()))
            }
            Transaction::SubmitJob {
                model_id,
                dataset_cid,
                config,
            } => {
                let job = self.jobs.submit_job(state, &model_id, &dataset_cid, config)?;
                let event = Event::JobCreated {
                    job_id: job.id.clone(),
                    model_id: job.model_id.clone(),
                    dataset_cid: job.dataset_cid.clone(),
                };
                Ok((TxReceipt::created(job.id), vec![event]))
            }
            Transaction::RegisterShard {
                shard_id,
                job_id,
                cid,
                hash,
                size,
            } => {
                let shard = self.shards.register_shard(
                    state,
                    Shard {
                        id: shard_id,
                        job_id,
                        cid,
                        hash,
                        node_id: None,
                        status: ShardStatus::Pending,
                        size,
                    },
                )?;
                Ok((TxReceipt::created(shard.id), Vec::new()))
            }
            Transaction::CreateTask {
                job_id,
                shard_id,
                node_id,
            } => {
                let task = self.jobs.create_task(state, &job_id, &shard_id)?;
                let mut events = vec![Event::TaskCreated {
                    task_id: task.id.clone(),
                    job_id: job_id.clone(),
                    shard_id: shard_id.clone(),
                }];
                if let Some(node_id) = node_id {
                    events.push(self.recovery.reassign_task(state, &task.id, &node_id)?);
                }
                Ok((TxReceipt::created(task.id), events))
            }
            Transaction::UpdateTaskStatus {
                task_id,
                status,
                progress,
                checkpoint_cid,
            } => {
                let new_status = TaskStatus::parse(&status).ok_or_else(|| {
                    OrchestratorError::InvalidArgument(format!("unknown task status: {status}"))
                })?;
                let events =
                    self.update_task_status(state, &task_id, new_status, progress, checkpoint_cid)?;
                Ok((TxReceipt::default(), events))
            }
            Transaction::DispatchJob { job_id } => {
                let events = self.dispatch_job(state, &job_id)?;
                Ok((TxReceipt::created(job_id), events))
            }
            Transaction::SubmitGradient {
                job_id,
                round,
                node_id,
                gradient_cid,
                contribution_weight,
            } => {
                self.jobs.get_job(state, &job_id)?;
                self.nodes.get_node(state, &node_id)?;
                let expected = self.current_round(state, &job_id)?;
                if round != expected {
                    return Err(OrchestratorError::RoundMismatch {
                        job_id,
                        expected,
                        actual: round,
                    });
                }
                self.contributions.track_contribution(
                    state,
                    &job_id,
                    &node_id,
                    round,
                    &gradient_cid,
                    contribution_weight,
                )?;
                Ok((TxReceipt::default(), Vec::new()))
            }
            Transaction::CompleteRound {
                job_id,
                round,
                aggregate_cid,
            } => {
                self.jobs.get_job(state, &job_id)?;
                if aggregate_cid.is_empty() {
                    return Err(OrchestratorError::InvalidArgument(
                        "aggregate cid cannot be empty".to_string(),
                    ));
                }
                let expected = self.current_round(state, &job_id)?;
                if round != expected {
                    return Err(OrchestratorError::RoundMismatch {
                        job_id,
                        expected,
                        actual: round,
                    });
                }
                set_typed(state, &keys::round_key(&job_id), &(round + 1))?;
                let event = Event::RoundCompleted {
                    job_id,
                    round,
                    aggregate_cid,
                };
                Ok((TxReceipt::default(), vec![event]))
            }
            Transaction::DistributeRoundRewards {
                job_id,
                round,
                base_reward,
            } => {
                self.jobs.get_job(state, &job_id)?;
                let current = self.current_round(state, &job_id)?;
                if round >= current {
                    return Err(OrchestratorError::Precondition(format!(
                        "round {round} of job {job_id} has not completed"
                    )));
                }
                self.rewards.pay_round_rewards(
                    state,
                    bank,
                    &self.contributions,
                    &job_id,
                    round,
                    base_reward,
                )?;
                Ok((TxReceipt::default(), Vec::new()))
            }
            Transaction::FailJob { job_id } => {
                self.jobs.fail_job(state, &job_id)?;
                Ok((TxReceipt::default(), Vec::new()))
            }
        }
    }

    /// Status update plus its cross-cutting effects: node active sets,
    /// shard lifecycle, job progress.
    fn update_task_status<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        task_id: &str,
        new_status: TaskStatus,
        progress: Option<f64>,
        checkpoint_cid: Option<String>,
    ) -> OrchestratorResult<Vec<Event>> {
        let previous = self.jobs.get_task(state, task_id)?;
        let task =
            self.jobs
                .update_task_status(state, task_id, new_status, progress, checkpoint_cid)?;

        if let Some(node_id) = &previous.node_id {
            if task.node_id.is_none() || new_status.is_terminal() {
                self.nodes.remove_active_task(state, node_id, task_id)?;
            }
            if new_status == TaskStatus::Rollback {
                if let Some(shard) = self.shards.try_get_shard(state, &task.shard_id)? {
                    if shard.is_assigned_to(node_id) {
                        self.shards.unbind_shard(state, &task.shard_id)?;
                    }
                }
            }
        }

        if new_status.is_terminal() {
            if self.shards.try_get_shard(state, &task.shard_id)?.is_some() {
                let shard_status = if new_status == TaskStatus::Completed {
                    ShardStatus::Completed
                } else {
                    ShardStatus::Failed
                };
                self.shards.mark_status(state, &task.shard_id, shard_status)?;
            }
            self.jobs.refresh_job(state, &task.job_id)?;
        } else if new_status == TaskStatus::InProgress {
            self.jobs.refresh_job(state, &task.job_id)?;
        }

        Ok(vec![Event::TaskStatusUpdated {
            task_id: task_id.to_string(),
            status: new_status.as_str().to_string(),
        }])
    }

    /// Assign every unbound pending task of a job through the scheduler.
    ///
    /// Tasks whose assignment fails validation stay pending; they are
    /// retried by the recovery sweep.
    fn dispatch_job<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        job_id: &str,
    ) -> OrchestratorResult<Vec<Event>> {
        let job = self.jobs.get_job(state, job_id)?;
        let pending: Vec<Task> = self
            .jobs
            .get_tasks_by_job(state, job_id)?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending && task.node_id.is_none())
            .collect();

        let mut events = Vec::new();
        for task in pending {
            let node_id = match self.scheduler.select_node(state) {
                Ok(node_id) => node_id,
                Err(OrchestratorError::NoNodesAvailable) => {
                    debug!(job_id = %job_id, "Dispatch stopped: no nodes available");
                    break;
                }
                Err(e) => return Err(e),
            };
            match self.recovery.reassign_task(state, &task.id, &node_id) {
                Ok(event) => {
                    self.scheduler.record_request(state, &node_id, &job.model_id);
                    events.push(event);
                }
                Err(e) if !e.is_fatal() => {
                    debug!(
                        task_id = %task.id,
                        node_id = %node_id,
                        error = %e,
                        "Dispatch assignment skipped"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.jobs.refresh_job(state, job_id)?;
        Ok(events)
    }
}

/// The replicated orchestration core.
pub struct Orchestrator {
    store: StateStore,
    components: Components,
    registry: ModuleRegistry,
    bank: Box<dyn Bank>,
}

impl Orchestrator {
    /// Build an orchestrator over an empty store.
    pub fn new(config: OrchestratorConfig, bank: Box<dyn Bank>) -> Self {
        let components = Components::new(config.clone());

        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(components.nodes.clone()));
        registry.register(Box::new(components.shards.clone()));
        registry.register(Box::new(components.models.clone()));
        registry.register(Box::new(components.jobs.clone()));
        registry.register(Box::new(components.health.clone()));

        Self {
            store: StateStore::new(),
            components,
            registry,
            bank,
        }
    }

    /// Build an orchestrator with a shared in-memory bank, returning the
    /// bank handle for inspection.
    pub fn new_in_memory(config: OrchestratorConfig) -> (Self, SharedBank) {
        let bank = SharedBank::new(MemoryBank::new());
        (Self::new(config, Box::new(bank.clone())), bank)
    }

    /// The configuration this replica runs with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.components.config
    }

    /// Apply one ordered block of transactions.
    ///
    /// Non-fatal transaction errors are reported in the outcome and leave
    /// no trace in state; a fatal error aborts the whole block.
    pub fn apply_block(
        &mut self,
        ctx: BlockContext,
        txs: Vec<Transaction>,
    ) -> OrchestratorResult<BlockOutcome> {
        let Self {
            store,
            components,
            registry,
            bank,
        } = self;

        let mut block = store.begin_block(ctx);
        registry.begin_block(&mut block)?;

        let mut events = Vec::new();
        let mut results = Vec::new();
        for tx in txs {
            let mut scope = block.begin_tx();
            match components.apply_tx(&mut scope, bank.as_mut(), tx) {
                Ok((receipt, tx_events)) => {
                    scope.commit();
                    events.extend(tx_events);
                    results.push(Ok(receipt));
                }
                Err(e) if e.is_fatal() => {
                    error!(height = ctx.height, error = %e, "Fatal error, aborting block");
                    scope.discard();
                    block.discard();
                    return Err(e);
                }
                Err(e) => {
                    debug!(height = ctx.height, error = %e, "Transaction rejected");
                    scope.discard();
                    results.push(Err(e));
                }
            }
        }

        // End-of-block: health sweep, then recovery for each offline node.
        let sweep_events = registry.end_block(&mut block)?;
        for event in sweep_events {
            let offline_node = match &event {
                Event::NodeOffline { node_id } => Some(node_id.clone()),
                _ => None,
            };
            events.push(event);
            if let Some(node_id) = offline_node {
                let recovery_events =
                    components.recovery.handle_node_offline(&mut block, &node_id)?;
                events.extend(recovery_events);
            }
        }

        block.commit();
        info!(
            height = ctx.height,
            events = events.len(),
            "Block applied"
        );
        Ok(BlockOutcome {
            height: ctx.height,
            events,
            results,
        })
    }

    /// Load a genesis document (an object keyed by module name).
    pub fn init_genesis(&mut self, genesis: &serde_json::Value) -> OrchestratorResult<()> {
        let mut block = self.store.begin_block(BlockContext::new(0, 0));
        self.registry.init_genesis(&mut block, genesis)?;
        block.commit();
        Ok(())
    }

    /// Export the full state as a genesis document.
    pub fn export_genesis(&self) -> OrchestratorResult<serde_json::Value> {
        Ok(self.registry.export_genesis(&self.store)?)
    }

    /// An immutable snapshot of committed state for concurrent readers.
    pub fn snapshot(&self) -> StateStore {
        self.store.snapshot()
    }

    // Read-side queries over committed state.

    pub fn get_node(&self, node_id: &str) -> OrchestratorResult<Node> {
        self.components.nodes.get_node(&self.store, node_id)
    }

    pub fn list_nodes(&self) -> OrchestratorResult<Vec<Node>> {
        self.components.nodes.list_nodes(&self.store)
    }

    pub fn get_model(&self, model_id: &str) -> OrchestratorResult<Model> {
        self.components.models.get_model(&self.store, model_id)
    }

    pub fn list_models(&self) -> OrchestratorResult<Vec<Model>> {
        self.components.models.list_models(&self.store)
    }

    pub fn get_job(&self, job_id: &str) -> OrchestratorResult<Job> {
        self.components.jobs.get_job(&self.store, job_id)
    }

    pub fn list_jobs(&self) -> OrchestratorResult<Vec<Job>> {
        self.components.jobs.list_jobs(&self.store)
    }

    pub fn get_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.components.jobs.get_task(&self.store, task_id)
    }

    pub fn get_tasks_by_job(&self, job_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.components.jobs.get_tasks_by_job(&self.store, job_id)
    }

    pub fn get_shard(&self, shard_id: &str) -> OrchestratorResult<Shard> {
        self.components.shards.get_shard(&self.store, shard_id)
    }

    pub fn get_shards_for_job(&self, job_id: &str) -> OrchestratorResult<Vec<Shard>> {
        self.components.shards.get_shards_for_job(&self.store, job_id)
    }

    pub fn get_shards_by_node(&self, node_id: &str) -> OrchestratorResult<Vec<Shard>> {
        self.components.shards.get_shards_by_node(&self.store, node_id)
    }

    /// Whether any shard already carries `hash`.
    pub fn check_duplicate_shard(&self, hash: &str) -> OrchestratorResult<bool> {
        self.components
            .validator
            .check_duplicate_shard(&self.store, hash)
    }

    /// Whether `shard_id` could be bound to `node_id` right now.
    pub fn validate_shard_assignment(
        &self,
        shard_id: &str,
        node_id: &str,
    ) -> OrchestratorResult<()> {
        self.components
            .validator
            .validate_shard_assignment(&self.store, shard_id, node_id)
    }

    /// The round a job is currently collecting.
    pub fn current_round(&self, job_id: &str) -> OrchestratorResult<u64> {
        self.components.current_round(&self.store, job_id)
    }

    pub fn contributions_for_round(
        &self,
        job_id: &str,
        round: u64,
    ) -> OrchestratorResult<Vec<GradientContribution>> {
        self.components
            .contributions
            .contributions_for_round(&self.store, job_id, round)
    }

    /// Normalized fair-share rewards for a round.
    pub fn fair_rewards(&self, job_id: &str, round: u64) -> OrchestratorResult<BTreeMap<String, f64>> {
        self.components
            .contributions
            .fair_rewards(&self.store, job_id, round)
    }
}

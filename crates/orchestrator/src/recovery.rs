//! Recovery coordinator.
//!
//! Reacts to `node_offline` events: affected tasks are rolled back to the
//! pending pool (through the observable `rollback` transient), their shard
//! bindings released, and the pending pool is reassigned round-robin over
//! the currently healthy candidate set. Per-task reassignment failures are
//! skipped; the task stays pending for the next sweep.

use crate::error::OrchestratorResult;
use crate::health::HealthMonitor;
use crate::jobs::JobEngine;
use crate::nodes::NodeRegistry;
use crate::shards::ShardRegistry;
use crate::validation::AssignmentValidator;
use atlas_state::StateView;
use atlas_types::{Event, TaskStatus};
use tracing::{debug, info, warn};

/// Rollback and reassignment on node failure.
#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    nodes: NodeRegistry,
    jobs: JobEngine,
    shards: ShardRegistry,
    health: HealthMonitor,
    validator: AssignmentValidator,
}

impl RecoveryCoordinator {
    pub fn new(
        nodes: NodeRegistry,
        jobs: JobEngine,
        shards: ShardRegistry,
        health: HealthMonitor,
        validator: AssignmentValidator,
    ) -> Self {
        Self {
            nodes,
            jobs,
            shards,
            health,
            validator,
        }
    }

    /// Roll back everything bound to `node_id` and requeue the pending
    /// pool.
    pub fn handle_node_offline<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
    ) -> OrchestratorResult<Vec<Event>> {
        info!(node_id = %node_id, "Handling node offline");

        let mut events = self.rollback_tasks_for_node(state, node_id)?;
        events.extend(self.reassign_pending_tasks(state)?);
        Ok(events)
    }

    /// Move every assigned/in-progress task of `node_id` back to pending.
    pub fn rollback_tasks_for_node<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        node_id: &str,
    ) -> OrchestratorResult<Vec<Event>> {
        let mut affected = Vec::new();
        self.jobs.iterate_tasks(state, |task| {
            if task.node_id.as_deref() == Some(node_id)
                && matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress)
            {
                affected.push((task.id.clone(), task.shard_id.clone()));
            }
            false
        })?;

        let mut events = Vec::new();
        for (task_id, shard_id) in affected {
            // Two writes: the rollback transient is observable state.
            self.jobs
                .update_task_status(state, &task_id, TaskStatus::Rollback, None, None)?;
            events.push(Event::TaskStatusUpdated {
                task_id: task_id.clone(),
                status: TaskStatus::Rollback.as_str().to_string(),
            });
            self.jobs
                .update_task_status(state, &task_id, TaskStatus::Pending, None, None)?;
            events.push(Event::TaskStatusUpdated {
                task_id: task_id.clone(),
                status: TaskStatus::Pending.as_str().to_string(),
            });

            self.nodes.remove_active_task(state, node_id, &task_id)?;

            if let Some(shard) = self.shards.try_get_shard(state, &shard_id)? {
                if shard.is_assigned_to(node_id) {
                    self.shards.unbind_shard(state, &shard_id)?;
                }
            }

            debug!(task_id = %task_id, node_id = %node_id, "Task rolled back");
        }

        Ok(events)
    }

    /// Round-robin the unbound pending pool across healthy candidates.
    ///
    /// Validator rejections and capacity exhaustion skip the task; it
    /// remains pending and is retried on the next sweep.
    pub fn reassign_pending_tasks<S: StateView + ?Sized>(
        &self,
        state: &mut S,
    ) -> OrchestratorResult<Vec<Event>> {
        let mut pending = Vec::new();
        self.jobs.iterate_tasks(state, |task| {
            if task.status == TaskStatus::Pending && task.node_id.is_none() {
                pending.push(task.id.clone());
            }
            false
        })?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for node in self.nodes.list_nodes(state)? {
            if node.is_online() && self.health.check_node_health(state, &node.id)? {
                candidates.push(node.id);
            }
        }
        if candidates.is_empty() {
            debug!(pending = pending.len(), "No candidates for reassignment");
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        for (i, task_id) in pending.iter().enumerate() {
            let target = &candidates[i % candidates.len()];
            match self.reassign_task(state, task_id, target) {
                Ok(event) => events.push(event),
                Err(e) if !e.is_fatal() => {
                    warn!(
                        task_id = %task_id,
                        node_id = %target,
                        error = %e,
                        "Reassignment skipped"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    /// Bind one pending task (and its shard) to `node_id` after
    /// validation.
    pub fn reassign_task<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        task_id: &str,
        node_id: &str,
    ) -> OrchestratorResult<Event> {
        self.validator
            .validate_task_assignment(state, task_id, node_id)?;

        let task = self.jobs.get_task(state, task_id)?;
        if self.shards.try_get_shard(state, &task.shard_id)?.is_some() {
            self.validator
                .validate_shard_assignment(state, &task.shard_id, node_id)?;
        }

        let task = self.jobs.bind_task(state, task_id, node_id)?;
        self.nodes.add_active_task(state, node_id, task_id)?;
        if self.shards.try_get_shard(state, &task.shard_id)?.is_some() {
            self.shards
                .assign_shard_to_node(state, &task.shard_id, node_id)?;
        }

        debug!(task_id = %task_id, node_id = %node_id, "Task reassigned");
        Ok(Event::TaskStatusUpdated {
            task_id: task_id.to_string(),
            status: TaskStatus::Assigned.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};
    use atlas_types::{NodeResources, OrchestratorConfig};

    struct Fixture {
        store: StateStore,
        nodes: NodeRegistry,
        jobs: JobEngine,
        shards: ShardRegistry,
        recovery: RecoveryCoordinator,
    }

    fn fixture() -> Fixture {
        let config = OrchestratorConfig::default();
        let nodes = NodeRegistry::new(config.clone());
        let jobs = JobEngine::new();
        let shards = ShardRegistry::new();
        let health = HealthMonitor::new(config.clone(), nodes.clone());
        let validator = AssignmentValidator::new(
            config,
            nodes.clone(),
            shards.clone(),
            jobs.clone(),
            health.clone(),
        );
        let recovery = RecoveryCoordinator::new(
            nodes.clone(),
            jobs.clone(),
            shards.clone(),
            health,
            validator,
        );
        Fixture {
            store: StateStore::new(),
            nodes,
            jobs,
            shards,
            recovery,
        }
    }

    /// Scenario: t1 in progress and t2 assigned on n1, t3 in progress on
    /// n2. When n1 goes offline, t1/t2 return to pending and t3 is
    /// untouched.
    #[test]
    fn test_offline_rolls_back_only_affected_tasks() {
        let mut f = fixture();
        let mut scope = f.store.begin_block(BlockContext::new(1, 0));

        for id in ["n1", "n2"] {
            f.nodes
                .register_node(&mut scope, id, "addr", NodeResources::default())
                .unwrap();
        }
        let job = f
            .jobs
            .submit_job(&mut scope, "model-m-v1", "cid-data", Default::default())
            .unwrap();

        let t1 = f.jobs.create_task(&mut scope, &job.id, "s1").unwrap();
        let t2 = f.jobs.create_task(&mut scope, &job.id, "s2").unwrap();
        let t3 = f.jobs.create_task(&mut scope, &job.id, "s3").unwrap();

        f.jobs.bind_task(&mut scope, &t1.id, "n1").unwrap();
        f.nodes.add_active_task(&mut scope, "n1", &t1.id).unwrap();
        f.jobs
            .update_task_status(&mut scope, &t1.id, TaskStatus::InProgress, None, None)
            .unwrap();

        f.jobs.bind_task(&mut scope, &t2.id, "n1").unwrap();
        f.nodes.add_active_task(&mut scope, "n1", &t2.id).unwrap();

        f.jobs.bind_task(&mut scope, &t3.id, "n2").unwrap();
        f.nodes.add_active_task(&mut scope, "n2", &t3.id).unwrap();
        f.jobs
            .update_task_status(&mut scope, &t3.id, TaskStatus::InProgress, None, None)
            .unwrap();

        // n1 is gone; mark it offline so reassignment avoids it.
        f.nodes.deregister_node(&mut scope, "n1").unwrap();
        f.recovery.handle_node_offline(&mut scope, "n1").unwrap();

        // t1 and t2 were rolled back and immediately reassigned to n2 (the
        // only healthy candidate).
        for task_id in [&t1.id, &t2.id] {
            let task = f.jobs.get_task(&scope, task_id).unwrap();
            assert_eq!(task.status, TaskStatus::Assigned);
            assert_eq!(task.node_id.as_deref(), Some("n2"));
        }

        let t3_after = f.jobs.get_task(&scope, &t3.id).unwrap();
        assert_eq!(t3_after.status, TaskStatus::InProgress);
        assert_eq!(t3_after.node_id.as_deref(), Some("n2"));
    }

    #[test]
    fn test_rollback_without_candidates_leaves_pending() {
        let mut f = fixture();
        let mut scope = f.store.begin_block(BlockContext::new(1, 0));

        f.nodes
            .register_node(&mut scope, "n1", "addr", NodeResources::default())
            .unwrap();
        let job = f
            .jobs
            .submit_job(&mut scope, "model-m-v1", "cid-data", Default::default())
            .unwrap();
        let task = f.jobs.create_task(&mut scope, &job.id, "s1").unwrap();
        f.jobs.bind_task(&mut scope, &task.id, "n1").unwrap();
        f.nodes.add_active_task(&mut scope, "n1", &task.id).unwrap();

        f.nodes.deregister_node(&mut scope, "n1").unwrap();
        let events = f.recovery.handle_node_offline(&mut scope, "n1").unwrap();

        let task = f.jobs.get_task(&scope, &task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.node_id, None);

        // rollback + pending transitions were both observable.
        let statuses: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::TaskStatusUpdated { status, .. } => Some(status.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec!["rollback", "pending"]);
    }

    #[test]
    fn test_rollback_releases_shard_binding() {
        let mut f = fixture();
        let mut scope = f.store.begin_block(BlockContext::new(1, 0));

        f.nodes
            .register_node(&mut scope, "n1", "addr", NodeResources::default())
            .unwrap();
        let job = f
            .jobs
            .submit_job(&mut scope, "model-m-v1", "cid-data", Default::default())
            .unwrap();
        let task = f.jobs.create_task(&mut scope, &job.id, "s1").unwrap();

        f.shards
            .register_shard(
                &mut scope,
                atlas_types::Shard {
                    id: "s1".to_string(),
                    job_id: job.id.clone(),
                    cid: "cid-s1".to_string(),
                    hash: "h1".to_string(),
                    node_id: None,
                    status: atlas_types::ShardStatus::Pending,
                    size: 16,
                },
            )
            .unwrap();
        f.shards
            .assign_shard_to_node(&mut scope, "s1", "n1")
            .unwrap();
        f.jobs.bind_task(&mut scope, &task.id, "n1").unwrap();
        f.nodes.add_active_task(&mut scope, "n1", &task.id).unwrap();

        f.nodes.deregister_node(&mut scope, "n1").unwrap();
        f.recovery
            .rollback_tasks_for_node(&mut scope, "n1")
            .unwrap();

        let shard = f.shards.get_shard(&scope, "s1").unwrap();
        assert_eq!(shard.node_id, None);
        assert_eq!(shard.status, atlas_types::ShardStatus::Pending);
    }

    #[test]
    fn test_reassignment_skips_full_nodes() {
        let mut f = fixture();
        let mut scope = f.store.begin_block(BlockContext::new(1, 0));

        f.nodes
            .register_node(&mut scope, "n1", "addr", NodeResources::default())
            .unwrap();
        for i in 0..10 {
            f.nodes
                .add_active_task(&mut scope, "n1", &format!("busy-{i}"))
                .unwrap();
        }
        let job = f
            .jobs
            .submit_job(&mut scope, "model-m-v1", "cid-data", Default::default())
            .unwrap();
        let task = f.jobs.create_task(&mut scope, &job.id, "s1").unwrap();

        let events = f.recovery.reassign_pending_tasks(&mut scope).unwrap();
        assert!(events.is_empty());

        let task = f.jobs.get_task(&scope, &task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }
}

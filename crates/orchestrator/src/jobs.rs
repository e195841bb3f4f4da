//! Job and task engine.
//!
//! Owns the `job:` and `task:` namespaces: job submission, task creation
//! and the task status state machine. Cross-cutting effects of a status
//! change (node active sets, shard bindings, reward payout) are composed
//! by the orchestrator facade, not here.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::keys;
use atlas_state::{get_typed, set_typed, StateRead, StateStore, StateView, StoreError};
use atlas_types::{Job, JobStatus, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Replicated job/task engine.
#[derive(Debug, Clone, Default)]
pub struct JobEngine;

#[derive(Debug, Serialize, Deserialize)]
struct TrainingGenesis {
    jobs: Vec<Job>,
    tasks: Vec<Task>,
}

impl JobEngine {
    pub fn new() -> Self {
        Self
    }

    /// Submit a job. The id is derived from block time, so at most one job
    /// can be submitted per block; a second submission collides and is
    /// rejected.
    pub fn submit_job<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        model_id: &str,
        dataset_cid: &str,
        config: BTreeMap<String, String>,
    ) -> OrchestratorResult<Job> {
        if model_id.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "model id cannot be empty".to_string(),
            ));
        }
        if dataset_cid.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "dataset cid cannot be empty".to_string(),
            ));
        }

        let now = state.ctx().block_time_ns;
        let job_id = format!("job-{now}");
        if self.try_get_job(state, &job_id)?.is_some() {
            return Err(OrchestratorError::already_exists("job", &job_id));
        }

        let job = Job {
            id: job_id,
            model_id: model_id.to_string(),
            dataset_cid: dataset_cid.to_string(),
            config,
            status: JobStatus::Pending,
            created_at_ns: now,
            updated_at_ns: now,
            progress: 0.0,
            task_ids: Vec::new(),
        };
        self.set_job(state, &job)?;

        debug!(job_id = %job.id, model_id = %job.model_id, "Job submitted");
        Ok(job)
    }

    /// Create a pending task under a job.
    ///
    /// Ids derive from block time with a sequence suffix for uniqueness
    /// within a block.
    pub fn create_task<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        job_id: &str,
        shard_id: &str,
    ) -> OrchestratorResult<Task> {
        let mut job = self.get_job(state, job_id)?;
        let now = state.ctx().block_time_ns;

        let mut task_id = format!("task-{now}");
        let mut seq = 0u32;
        while self.try_get_task(state, &task_id)?.is_some() {
            seq += 1;
            task_id = format!("task-{now}-{seq}");
        }

        let task = Task {
            id: task_id,
            job_id: job_id.to_string(),
            shard_id: shard_id.to_string(),
            node_id: None,
            status: TaskStatus::Pending,
            created_at_ns: now,
            updated_at_ns: now,
            progress: 0.0,
            checkpoint_cid: None,
        };
        self.set_task(state, &task)?;

        job.task_ids.push(task.id.clone());
        job.updated_at_ns = now;
        self.set_job(state, &job)?;

        debug!(task_id = %task.id, job_id = %job_id, shard_id = %shard_id, "Task created");
        Ok(task)
    }

    /// Bind a pending task to a node (`pending -> assigned`).
    pub fn bind_task<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        task_id: &str,
        node_id: &str,
    ) -> OrchestratorResult<Task> {
        let mut task = self.get_task(state, task_id)?;
        if !task.status.can_transition_to(TaskStatus::Assigned) {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Assigned,
            });
        }

        task.node_id = Some(node_id.to_string());
        task.status = TaskStatus::Assigned;
        task.updated_at_ns = state.ctx().block_time_ns;
        self.set_task(state, &task)?;
        Ok(task)
    }

    /// Apply a status update through the task state machine.
    ///
    /// Progress updates are ignored when negative (the "unchanged"
    /// sentinel) and rejected when above one; checkpoints only replace the
    /// stored one when non-empty. Transitions into a status that forbids a
    /// node binding clear it.
    pub fn update_task_status<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        task_id: &str,
        new_status: TaskStatus,
        progress: Option<f64>,
        checkpoint_cid: Option<String>,
    ) -> OrchestratorResult<Task> {
        let mut task = self.get_task(state, task_id)?;
        if !task.status.can_transition_to(new_status) {
            return Err(OrchestratorError::InvalidTransition {
                from: task.status,
                to: new_status,
            });
        }

        if let Some(progress) = progress {
            if progress.is_nan() || progress > 1.0 {
                return Err(OrchestratorError::InvalidArgument(format!(
                    "progress out of range: {progress}"
                )));
            }
            if progress >= 0.0 {
                task.progress = progress;
            }
        }
        if let Some(checkpoint) = checkpoint_cid {
            if !checkpoint.is_empty() {
                task.checkpoint_cid = Some(checkpoint);
            }
        }

        task.status = new_status;
        if new_status.forbids_node() {
            task.node_id = None;
        }
        task.updated_at_ns = state.ctx().block_time_ns;
        self.set_task(state, &task)?;

        debug!(task_id = %task.id, status = %new_status, "Task status updated");
        Ok(task)
    }

    /// Fetch a job, failing with `NotFound` when absent.
    pub fn get_job<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
    ) -> OrchestratorResult<Job> {
        self.try_get_job(state, job_id)?
            .ok_or_else(|| OrchestratorError::not_found("job", job_id))
    }

    pub fn try_get_job<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
    ) -> Result<Option<Job>, StoreError> {
        get_typed(state, &keys::job_key(job_id))
    }

    /// Fetch a task, failing with `NotFound` when absent.
    pub fn get_task<S: StateRead + ?Sized>(
        &self,
        state: &S,
        task_id: &str,
    ) -> OrchestratorResult<Task> {
        self.try_get_task(state, task_id)?
            .ok_or_else(|| OrchestratorError::not_found("task", task_id))
    }

    pub fn try_get_task<S: StateRead + ?Sized>(
        &self,
        state: &S,
        task_id: &str,
    ) -> Result<Option<Task>, StoreError> {
        get_typed(state, &keys::task_key(task_id))
    }

    /// All jobs in id order.
    pub fn list_jobs<S: StateRead + ?Sized>(&self, state: &S) -> OrchestratorResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for (_, bytes) in state.iter_prefix(keys::JOB_PREFIX.as_bytes()) {
            jobs.push(atlas_state::decode(&bytes)?);
        }
        Ok(jobs)
    }

    /// All tasks of a job, in task id order.
    pub fn get_tasks_by_job<S: StateRead + ?Sized>(
        &self,
        state: &S,
        job_id: &str,
    ) -> OrchestratorResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for (_, bytes) in state.iter_prefix(keys::TASK_PREFIX.as_bytes()) {
            let task: Task = atlas_state::decode(&bytes)?;
            if task.job_id == job_id {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Visit all tasks in id order until the handler returns `true`.
    pub fn iterate_tasks<S, F>(&self, state: &S, mut handler: F) -> OrchestratorResult<()>
    where
        S: StateRead + ?Sized,
        F: FnMut(&Task) -> bool,
    {
        for (_, bytes) in state.iter_prefix(keys::TASK_PREFIX.as_bytes()) {
            let task: Task = atlas_state::decode(&bytes)?;
            if handler(&task) {
                break;
            }
        }
        Ok(())
    }

    /// Recompute a job's progress and terminal status from its tasks.
    ///
    /// Progress is the completed-task fraction and never decreases. The job
    /// completes when every task is terminal, failing if any task failed.
    pub fn refresh_job<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        job_id: &str,
    ) -> OrchestratorResult<Job> {
        let mut job = self.get_job(state, job_id)?;
        if job.status.is_terminal() || job.task_ids.is_empty() {
            return Ok(job);
        }

        let tasks = self.get_tasks_by_job(state, job_id)?;
        let total = tasks.len();
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();

        let progress = completed as f64 / total as f64;
        if progress > job.progress {
            job.progress = progress;
        }

        if completed + failed == total {
            job.status = if failed == 0 {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
        } else if job.status == JobStatus::Pending
            && tasks.iter().any(|t| t.status != TaskStatus::Pending)
        {
            job.status = JobStatus::InProgress;
        }

        job.updated_at_ns = state.ctx().block_time_ns;
        self.set_job(state, &job)?;
        Ok(job)
    }

    /// Force a job into the failed state (failed round path).
    pub fn fail_job<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        job_id: &str,
    ) -> OrchestratorResult<Job> {
        let mut job = self.get_job(state, job_id)?;
        if !job.status.is_terminal() {
            job.status = JobStatus::Failed;
            job.updated_at_ns = state.ctx().block_time_ns;
            self.set_job(state, &job)?;
        }
        Ok(job)
    }

    pub(crate) fn set_job<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        job: &Job,
    ) -> Result<(), StoreError> {
        set_typed(state, &keys::job_key(&job.id), job)
    }

    pub(crate) fn set_task<S: StateView + ?Sized>(
        &self,
        state: &mut S,
        task: &Task,
    ) -> Result<(), StoreError> {
        set_typed(state, &keys::task_key(&task.id), task)
    }
}

impl atlas_state::Module for JobEngine {
    fn name(&self) -> &'static str {
        "training"
    }

    fn init_genesis(
        &mut self,
        state: &mut dyn StateView,
        genesis: &Value,
    ) -> Result<(), StoreError> {
        let doc: TrainingGenesis = serde_json::from_value(genesis.clone())
            .map_err(|e| StoreError::Genesis(e.to_string()))?;
        for job in &doc.jobs {
            self.set_job(state, job)?;
        }
        for task in &doc.tasks {
            self.set_task(state, task)?;
        }
        Ok(())
    }

    fn export_genesis(&self, store: &StateStore) -> Result<Value, StoreError> {
        let mut doc = TrainingGenesis {
            jobs: Vec::new(),
            tasks: Vec::new(),
        };
        for (_, bytes) in store.iter_prefix(keys::JOB_PREFIX.as_bytes()) {
            doc.jobs.push(atlas_state::decode(&bytes)?);
        }
        for (_, bytes) in store.iter_prefix(keys::TASK_PREFIX.as_bytes()) {
            doc.tasks.push(atlas_state::decode(&bytes)?);
        }
        serde_json::to_value(doc).map_err(|e| StoreError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_state::{BlockContext, StateStore};

    fn engine() -> JobEngine {
        JobEngine::new()
    }

    fn submit(scope: &mut dyn StateView, engine: &JobEngine) -> Job {
        engine
            .submit_job(scope, "model-m-v1", "cid-data", BTreeMap::new())
            .unwrap()
    }

    #[test]
    fn test_submit_job_id_from_block_time() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 123_456_789));

        let job = submit(&mut scope, &engine);
        assert_eq!(job.id, "job-123456789");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn test_task_ids_unique_within_block() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 42));

        let job = submit(&mut scope, &engine);
        let t1 = engine.create_task(&mut scope, &job.id, "s1").unwrap();
        let t2 = engine.create_task(&mut scope, &job.id, "s2").unwrap();
        let t3 = engine.create_task(&mut scope, &job.id, "s3").unwrap();
        assert_eq!(t1.id, "task-42");
        assert_eq!(t2.id, "task-42-1");
        assert_eq!(t3.id, "task-42-2");

        let job = engine.get_job(&scope, &job.id).unwrap();
        assert_eq!(job.task_ids, vec![t1.id, t2.id, t3.id]);
    }

    #[test]
    fn test_create_task_unknown_job() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let err = engine.create_task(&mut scope, "job-ghost", "s1").unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[test]
    fn test_status_machine_happy_path() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let task = engine.create_task(&mut scope, &job.id, "s1").unwrap();

        let task = engine.bind_task(&mut scope, &task.id, "n1").unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.node_id.as_deref(), Some("n1"));

        let task = engine
            .update_task_status(&mut scope, &task.id, TaskStatus::InProgress, Some(0.2), None)
            .unwrap();
        assert_eq!(task.progress, 0.2);

        let task = engine
            .update_task_status(
                &mut scope,
                &task.id,
                TaskStatus::Completed,
                Some(1.0),
                Some("cid-ckpt".to_string()),
            )
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.checkpoint_cid.as_deref(), Some("cid-ckpt"));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let task = engine.create_task(&mut scope, &job.id, "s1").unwrap();

        // pending -> completed skips assignment.
        let err = engine
            .update_task_status(&mut scope, &task.id, TaskStatus::Completed, None, None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));

        // The failed update left the task untouched.
        let unchanged = engine.get_task(&scope, &task.id).unwrap();
        assert_eq!(unchanged.status, TaskStatus::Pending);
    }

    #[test]
    fn test_progress_sentinel_and_bounds() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let task = engine.create_task(&mut scope, &job.id, "s1").unwrap();
        engine.bind_task(&mut scope, &task.id, "n1").unwrap();
        engine
            .update_task_status(&mut scope, &task.id, TaskStatus::InProgress, Some(0.5), None)
            .unwrap();

        // Negative progress means "unchanged".
        let task = engine
            .update_task_status(&mut scope, &task.id, TaskStatus::Paused, Some(-1.0), None)
            .unwrap();
        assert_eq!(task.progress, 0.5);

        // Above one is rejected outright.
        let err = engine
            .update_task_status(&mut scope, &task.id, TaskStatus::InProgress, Some(1.5), None)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
    }

    #[test]
    fn test_empty_checkpoint_ignored() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let task = engine.create_task(&mut scope, &job.id, "s1").unwrap();
        engine.bind_task(&mut scope, &task.id, "n1").unwrap();

        let task = engine
            .update_task_status(
                &mut scope,
                &task.id,
                TaskStatus::InProgress,
                None,
                Some(String::new()),
            )
            .unwrap();
        assert_eq!(task.checkpoint_cid, None);
    }

    #[test]
    fn test_rollback_clears_node_binding() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let task = engine.create_task(&mut scope, &job.id, "s1").unwrap();
        engine.bind_task(&mut scope, &task.id, "n1").unwrap();

        let task = engine
            .update_task_status(&mut scope, &task.id, TaskStatus::Rollback, None, None)
            .unwrap();
        assert_eq!(task.node_id, None);

        let task = engine
            .update_task_status(&mut scope, &task.id, TaskStatus::Pending, None, None)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.node_id, None);
    }

    #[test]
    fn test_job_refresh_progress_and_completion() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let t1 = engine.create_task(&mut scope, &job.id, "s1").unwrap();
        let t2 = engine.create_task(&mut scope, &job.id, "s2").unwrap();

        for task_id in [&t1.id, &t2.id] {
            engine.bind_task(&mut scope, task_id, "n1").unwrap();
            engine
                .update_task_status(&mut scope, task_id, TaskStatus::InProgress, None, None)
                .unwrap();
        }

        engine
            .update_task_status(&mut scope, &t1.id, TaskStatus::Completed, Some(1.0), None)
            .unwrap();
        let refreshed = engine.refresh_job(&mut scope, &job.id).unwrap();
        assert_eq!(refreshed.status, JobStatus::InProgress);
        assert!((refreshed.progress - 0.5).abs() < 1e-12);

        engine
            .update_task_status(&mut scope, &t2.id, TaskStatus::Completed, Some(1.0), None)
            .unwrap();
        let refreshed = engine.refresh_job(&mut scope, &job.id).unwrap();
        assert_eq!(refreshed.status, JobStatus::Completed);
        assert_eq!(refreshed.progress, 1.0);
    }

    #[test]
    fn test_job_fails_when_any_task_fails() {
        let engine = engine();
        let mut store = StateStore::new();
        let mut scope = store.begin_block(BlockContext::new(1, 0));

        let job = submit(&mut scope, &engine);
        let task = engine.create_task(&mut scope, &job.id, "s1").unwrap();
        engine.bind_task(&mut scope, &task.id, "n1").unwrap();
        engine
            .update_task_status(&mut scope, &task.id, TaskStatus::InProgress, None, None)
            .unwrap();
        engine
            .update_task_status(&mut scope, &task.id, TaskStatus::Failed, None, None)
            .unwrap();

        let refreshed = engine.refresh_job(&mut scope, &job.id).unwrap();
        assert_eq!(refreshed.status, JobStatus::Failed);
    }
}

//! Core types for the Atlas orchestration plane.
//!
//! This crate provides the shared entity definitions used across the
//! replicated state machine and the off-core workers: nodes, shards,
//! models, jobs, tasks, gradient contributions, statuses, events, and
//! the orchestrator configuration.

pub mod config;
pub mod event;
pub mod status;

pub use config::{OrchestratorConfig, SchedulerStrategy};
pub use event::Event;
pub use status::{JobStatus, NodeStatus, ShardStatus, TaskStatus};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared hardware resources of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeResources {
    /// CPU core count.
    pub cpu_cores: u32,
    /// GPU device count.
    pub gpu_count: u32,
    /// System memory in gigabytes.
    pub memory_gb: u32,
    /// Local storage in gigabytes.
    pub storage_gb: u32,
}

/// A registered compute node.
///
/// Nodes are never deleted; deregistration flips the status to offline and
/// clears the active task set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: String,
    /// Owner wallet address.
    pub address: String,
    /// Online/offline status.
    pub status: NodeStatus,
    /// Declared hardware resources.
    pub resources: NodeResources,
    /// Derived reputation in [0, 100].
    pub reputation: f64,
    /// Measured uptime in [0, 100].
    pub uptime_percent: f64,
    /// Block time of the last heartbeat, in nanoseconds.
    pub last_heartbeat_ns: u64,
    /// Block time of registration, in nanoseconds.
    pub registered_at_ns: u64,
    /// Tasks currently bound to this node.
    pub active_tasks: Vec<String>,
}

impl Node {
    /// Whether this node can accept another task under the given cap.
    pub fn has_capacity(&self, max_tasks_per_node: usize) -> bool {
        self.active_tasks.len() < max_tasks_per_node
    }

    /// Whether this node is currently online.
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

/// A content-addressed subset of a job's dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    /// Unique shard identifier.
    pub id: String,
    /// Owning job.
    pub job_id: String,
    /// Content address of the shard bytes.
    pub cid: String,
    /// SHA-256 content hash; empty when the producer did not hash.
    pub hash: String,
    /// Bound node, if any. Cleared again only through rollback.
    pub node_id: Option<String>,
    /// Lifecycle status.
    pub status: ShardStatus,
    /// Shard size in bytes.
    pub size: u64,
}

impl Shard {
    /// Whether this shard is bound to the given node.
    pub fn is_assigned_to(&self, node_id: &str) -> bool {
        self.node_id.as_deref() == Some(node_id)
    }
}

/// A versioned model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /// `model-<name>-<version>`.
    pub id: String,
    /// Model name.
    pub name: String,
    /// Model version.
    pub version: String,
    /// Content address of the artifact.
    pub cid: String,
    /// Block time of registration, in nanoseconds.
    pub created_at_ns: u64,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Model {
    /// Canonical model id for a name/version pair.
    pub fn model_id(name: &str, version: &str) -> String {
        format!("model-{}-{}", name, version)
    }
}

/// A user-submitted training or inference request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// `job-<block_time_ns>`.
    pub id: String,
    /// Referenced model.
    pub model_id: String,
    /// Content address of the dataset.
    pub dataset_cid: String,
    /// Opaque configuration map; not interpreted by the replicated core
    /// beyond the keys below.
    pub config: BTreeMap<String, String>,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Block time of submission, in nanoseconds.
    pub created_at_ns: u64,
    /// Block time of the last mutation, in nanoseconds.
    pub updated_at_ns: u64,
    /// Overall progress in [0, 1]; monotonically nondecreasing.
    pub progress: f64,
    /// Tasks created under this job.
    pub task_ids: Vec<String>,
}

impl Job {
    /// Per-job round deadline override, if configured.
    pub fn round_deadline_secs(&self) -> Option<u64> {
        self.config
            .get("round_deadline_seconds")
            .and_then(|value| value.parse().ok())
    }
}

/// A unit of off-core work binding a job, a shard, and (eventually) a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: String,
    /// Owning job.
    pub job_id: String,
    /// Shard this task computes over.
    pub shard_id: String,
    /// Bound node; present exactly when the status requires it.
    pub node_id: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Block time of creation, in nanoseconds.
    pub created_at_ns: u64,
    /// Block time of the last mutation, in nanoseconds.
    pub updated_at_ns: u64,
    /// Execution progress in [0, 1].
    pub progress: f64,
    /// Content address of the latest checkpoint, if any.
    pub checkpoint_cid: Option<String>,
}

/// A per-round, per-node gradient contribution record.
///
/// Keyed by `(job_id, node_id, round, gradient_cid)` in the store;
/// append-only within a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientContribution {
    /// Owning job.
    pub job_id: String,
    /// Contributing node.
    pub node_id: String,
    /// Round number, 0-indexed.
    pub round: u64,
    /// Content address of the submitted gradient vector.
    pub gradient_cid: String,
    /// Contribution weight used for reward apportionment.
    pub contribution: f64,
    /// Block time of acceptance, in nanoseconds.
    pub timestamp_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        Node {
            id: "n1".to_string(),
            address: "atlas1owner".to_string(),
            status: NodeStatus::Online,
            resources: NodeResources {
                cpu_cores: 8,
                gpu_count: 2,
                memory_gb: 32,
                storage_gb: 500,
            },
            reputation: 0.0,
            uptime_percent: 0.0,
            last_heartbeat_ns: 0,
            registered_at_ns: 0,
            active_tasks: Vec::new(),
        }
    }

    #[test]
    fn test_node_capacity() {
        let mut node = sample_node();
        assert!(node.has_capacity(10));
        node.active_tasks = (0..10).map(|i| format!("task-{i}")).collect();
        assert!(!node.has_capacity(10));
    }

    #[test]
    fn test_model_id_format() {
        assert_eq!(Model::model_id("resnet", "v2"), "model-resnet-v2");
    }

    #[test]
    fn test_job_round_deadline_override() {
        let mut job = Job {
            id: "job-1".to_string(),
            model_id: "model-m-v1".to_string(),
            dataset_cid: "cid-data".to_string(),
            config: BTreeMap::new(),
            status: JobStatus::Pending,
            created_at_ns: 0,
            updated_at_ns: 0,
            progress: 0.0,
            task_ids: Vec::new(),
        };
        assert_eq!(job.round_deadline_secs(), None);

        job.config
            .insert("round_deadline_seconds".to_string(), "120".to_string());
        assert_eq!(job.round_deadline_secs(), Some(120));

        job.config
            .insert("round_deadline_seconds".to_string(), "soon".to_string());
        assert_eq!(job.round_deadline_secs(), None);
    }

    #[test]
    fn test_entity_encode_decode_identity() {
        let node = sample_node();
        let bytes = serde_json::to_vec(&node).unwrap();
        let back: Node = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, node);

        let shard = Shard {
            id: "shard-1".to_string(),
            job_id: "job-1".to_string(),
            cid: "cid-shard".to_string(),
            hash: "abc123".to_string(),
            node_id: Some("n1".to_string()),
            status: ShardStatus::Assigned,
            size: 4096,
        };
        let bytes = serde_json::to_vec(&shard).unwrap();
        let back: Shard = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, shard);
    }
}

//! Status enums and transition rules for Atlas entities.
//!
//! Task transitions are the only non-trivial state machine here; every
//! other status is a plain lifecycle marker. The allowed task transitions
//! are enforced centrally so that no mutation path can bypass them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational status of a compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is reachable and heartbeating.
    Online,
    /// Node missed its heartbeat deadline or deregistered.
    Offline,
}

impl NodeStatus {
    /// String form used in store records and event attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a dataset shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// Registered, not yet bound to a node.
    Pending,
    /// Bound to a node.
    Assigned,
    /// All work over this shard finished.
    Completed,
    /// Work over this shard failed.
    Failed,
}

impl ShardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Pending => "pending",
            ShardStatus::Assigned => "assigned",
            ShardStatus::Completed => "completed",
            ShardStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no tasks dispatched yet.
    Pending,
    /// At least one task is running.
    InProgress,
    /// All tasks reached a terminal state successfully.
    Completed,
    /// The job was aborted (e.g. a failed round).
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether this status admits no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a node.
    Pending,
    /// Bound to a node, not yet started.
    Assigned,
    /// Executing on its node.
    InProgress,
    /// Execution suspended, node binding retained.
    Paused,
    /// Being unwound after a node failure; observable transient.
    Rollback,
    /// Handed to an external delegate; resolves to completed or failed
    /// when the delegate reports.
    Delegated,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Rollback => "rollback",
            TaskStatus::Delegated => "delegated",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Parse the wire/store form. Unknown strings are rejected.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "in_progress" => Some(TaskStatus::InProgress),
            "paused" => Some(TaskStatus::Paused),
            "rollback" => Some(TaskStatus::Rollback),
            "delegated" => Some(TaskStatus::Delegated),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Statuses that require a node binding.
    pub fn requires_node(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned
                | TaskStatus::InProgress
                | TaskStatus::Paused
                | TaskStatus::Delegated
        )
    }

    /// Statuses that require the node binding to be cleared.
    pub fn forbids_node(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Rollback)
    }

    /// Whether `self -> to` is an allowed transition.
    ///
    /// Anything not listed here is rejected. `Delegated` is only entered
    /// through the external delegation path, never through a status update.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Assigned)
                | (Assigned, InProgress)
                | (Assigned, Rollback)
                | (InProgress, Paused)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Rollback)
                | (Paused, InProgress)
                | (Paused, Rollback)
                | (Rollback, Pending)
                | (Delegated, Completed)
                | (Delegated, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

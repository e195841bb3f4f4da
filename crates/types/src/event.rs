//! Typed events emitted by the replicated state machine.
//!
//! Events are collected per block and handed to the surrounding node for
//! publication; they never feed back into replicated state directly.

use serde::{Deserialize, Serialize};

/// An event emitted by an orchestration module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new node joined the fleet.
    NodeRegistered { node_id: String, address: String },
    /// A node missed its heartbeat deadline.
    NodeOffline { node_id: String },
    /// A job was submitted.
    JobCreated {
        job_id: String,
        model_id: String,
        dataset_cid: String,
    },
    /// A task was created under a job.
    TaskCreated {
        task_id: String,
        job_id: String,
        shard_id: String,
    },
    /// A task changed status.
    TaskStatusUpdated { task_id: String, status: String },
    /// A model artifact was registered.
    ModelRegistered {
        model_id: String,
        name: String,
        version: String,
    },
    /// A gradient round finished and its aggregate was committed.
    RoundCompleted {
        job_id: String,
        round: u64,
        aggregate_cid: String,
    },
}

impl Event {
    /// Stable event name, matching the emitted `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Event::NodeRegistered { .. } => "node_registered",
            Event::NodeOffline { .. } => "node_offline",
            Event::JobCreated { .. } => "job_created",
            Event::TaskCreated { .. } => "task_created",
            Event::TaskStatusUpdated { .. } => "task_status_updated",
            Event::ModelRegistered { .. } => "model_registered",
            Event::RoundCompleted { .. } => "round_completed",
        }
    }
}

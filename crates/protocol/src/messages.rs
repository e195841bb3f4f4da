//! Wire payloads carried on Atlas pub/sub topics.
//!
//! All payloads are JSON. `ts` fields carry block time in nanoseconds on
//! messages originating from replicated state, and sender-local unix time
//! on messages originating from nodes.

use serde::{Deserialize, Serialize};

/// Announcement of a gradient submission for `(job_id, round)`.
///
/// Carried on `/atlas/fl/gradients/<job_id>`. The vector itself travels
/// through the blob store; only its content address is gossiped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientAnnouncement {
    pub node_id: String,
    pub job_id: String,
    pub round: u64,
    pub gradient_cid: String,
    pub ts: u64,
}

/// Publication of a round's aggregated model.
///
/// Carried on `/atlas/fl/model/<job_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub round: u64,
    pub aggregate_cid: String,
    pub ts: u64,
}

/// Notice that a task was rolled back off its node.
///
/// Carried on `/atlas/recovery/rollback/<job_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackNotice {
    pub task_id: String,
    pub node_id: String,
    pub ts: u64,
}

/// Liveness beacon from a node.
///
/// Carried on `/atlas/heartbeat/<node_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub node_id: String,
    pub ts: u64,
}

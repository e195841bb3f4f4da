//! Pub/sub topic definitions for the Atlas federated-learning protocol.
//!
//! Topics are per-entity channels using the format `/atlas/<area>/<name>/<id>`:
//! gradient announcements and model updates are scoped per job, rollback
//! notices per job, heartbeats per node.

use std::fmt;

/// Prefix for per-job gradient announcement topics.
pub const GRADIENTS_PREFIX: &str = "/atlas/fl/gradients/";

/// Prefix for per-job aggregated model update topics.
pub const MODEL_PREFIX: &str = "/atlas/fl/model/";

/// Prefix for per-job rollback notice topics.
pub const ROLLBACK_PREFIX: &str = "/atlas/recovery/rollback/";

/// Prefix for per-node heartbeat topics.
pub const HEARTBEAT_PREFIX: &str = "/atlas/heartbeat/";

/// A parsed Atlas topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Gradient announcements for a job.
    Gradients { job_id: String },
    /// Aggregated model updates for a job.
    Model { job_id: String },
    /// Rollback notices for a job.
    Rollback { job_id: String },
    /// Heartbeats from a node.
    Heartbeat { node_id: String },
}

impl Topic {
    /// The full topic string.
    pub fn as_string(&self) -> String {
        match self {
            Topic::Gradients { job_id } => format!("{GRADIENTS_PREFIX}{job_id}"),
            Topic::Model { job_id } => format!("{MODEL_PREFIX}{job_id}"),
            Topic::Rollback { job_id } => format!("{ROLLBACK_PREFIX}{job_id}"),
            Topic::Heartbeat { node_id } => format!("{HEARTBEAT_PREFIX}{node_id}"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Gradient announcement topic for a job.
pub fn gradients_topic(job_id: &str) -> String {
    Topic::Gradients {
        job_id: job_id.to_string(),
    }
    .as_string()
}

/// Model update topic for a job.
pub fn model_topic(job_id: &str) -> String {
    Topic::Model {
        job_id: job_id.to_string(),
    }
    .as_string()
}

/// Rollback notice topic for a job.
pub fn rollback_topic(job_id: &str) -> String {
    Topic::Rollback {
        job_id: job_id.to_string(),
    }
    .as_string()
}

/// Heartbeat topic for a node.
pub fn heartbeat_topic(node_id: &str) -> String {
    Topic::Heartbeat {
        node_id: node_id.to_string(),
    }
    .as_string()
}

/// Parse a topic string into a [`Topic`], rejecting unknown prefixes and
/// empty ids.
pub fn parse_topic(topic: &str) -> Option<Topic> {
    let strip = |prefix: &str| {
        topic
            .strip_prefix(prefix)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(str::to_string)
    };

    if let Some(job_id) = strip(GRADIENTS_PREFIX) {
        return Some(Topic::Gradients { job_id });
    }
    if let Some(job_id) = strip(MODEL_PREFIX) {
        return Some(Topic::Model { job_id });
    }
    if let Some(job_id) = strip(ROLLBACK_PREFIX) {
        return Some(Topic::Rollback { job_id });
    }
    if let Some(node_id) = strip(HEARTBEAT_PREFIX) {
        return Some(Topic::Heartbeat { node_id });
    }
    None
}

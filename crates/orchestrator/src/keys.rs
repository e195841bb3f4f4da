//! Persisted key layout.
//!
//! All replicated state lives under prefix-separated string keys so that
//! lexicographic prefix iteration enumerates one entity kind at a time:
//!
//! ```text
//! node:<id>
//! shard:<id>
//! model:<id>
//! job:<id>
//! task:<id>
//! gradient:<job>:<node>:<round>:<cid>
//! round:<job>
//! sched:<node>:<model>
//! round_robin_index
//! ```

/// Prefix for node records.
pub const NODE_PREFIX: &str = "node:";
/// Prefix for shard records.
pub const SHARD_PREFIX: &str = "shard:";
/// Prefix for model records.
pub const MODEL_PREFIX: &str = "model:";
/// Prefix for job records.
pub const JOB_PREFIX: &str = "job:";
/// Prefix for task records.
pub const TASK_PREFIX: &str = "task:";
/// Prefix for gradient contribution records.
pub const GRADIENT_PREFIX: &str = "gradient:";
/// Prefix for per-job round counters.
pub const ROUND_PREFIX: &str = "round:";
/// Prefix for per-node per-model scheduling counters.
pub const SCHED_PREFIX: &str = "sched:";
/// Key of the persistent round-robin scheduler index (big-endian u64).
pub const ROUND_ROBIN_INDEX_KEY: &[u8] = b"round_robin_index";

pub fn node_key(id: &str) -> Vec<u8> {
    format!("{NODE_PREFIX}{id}").into_bytes()
}

pub fn shard_key(id: &str) -> Vec<u8> {
    format!("{SHARD_PREFIX}{id}").into_bytes()
}

pub fn model_key(id: &str) -> Vec<u8> {
    format!("{MODEL_PREFIX}{id}").into_bytes()
}

pub fn job_key(id: &str) -> Vec<u8> {
    format!("{JOB_PREFIX}{id}").into_bytes()
}

pub fn task_key(id: &str) -> Vec<u8> {
    format!("{TASK_PREFIX}{id}").into_bytes()
}

pub fn gradient_key(job_id: &str, node_id: &str, round: u64, cid: &str) -> Vec<u8> {
    format!("{GRADIENT_PREFIX}{job_id}:{node_id}:{round}:{cid}").into_bytes()
}

/// Prefix covering every contribution of one job, all rounds.
pub fn gradient_job_prefix(job_id: &str) -> Vec<u8> {
    format!("{GRADIENT_PREFIX}{job_id}:").into_bytes()
}

pub fn round_key(job_id: &str) -> Vec<u8> {
    format!("{ROUND_PREFIX}{job_id}").into_bytes()
}

pub fn sched_request_key(node_id: &str, model_id: &str) -> Vec<u8> {
    format!("{SCHED_PREFIX}{node_id}:{model_id}").into_bytes()
}

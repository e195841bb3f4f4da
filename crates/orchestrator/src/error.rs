//! Error taxonomy of the orchestration plane.
//!
//! Every operation fails with a typed error that maps onto a small set of
//! stable [`ErrorKind`]s. Non-fatal errors leave replicated state untouched
//! (the failed input's staging layer is discarded); fatal errors abort the
//! whole input batch.

use atlas_state::StoreError;
use atlas_types::TaskStatus;
use thiserror::Error;

/// Stable error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Referenced entity does not exist.
    NotFound,
    /// Registration idempotency failure.
    AlreadyExists,
    /// Shard or task is bound elsewhere.
    AlreadyAssigned,
    /// Malformed input: empty id, unknown status, out-of-range value.
    InvalidArgument,
    /// State precondition not met: node offline, no capacity, duplicate
    /// content.
    Precondition,
    /// Gradient inputs rejected; the whole round is refused.
    Aggregation,
    /// State corruption or a failed transfer; aborts the input batch.
    Fatal,
}

impl ErrorKind {
    /// Stable string form for event attributes and RPC surfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::AlreadyAssigned => "already_assigned",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Aggregation => "aggregation",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Errors returned by orchestration operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("shard {id} already assigned to node {holder}")]
    ShardAlreadyAssigned { id: String, holder: String },

    #[error("task {id} already assigned to node {holder}")]
    TaskAlreadyAssigned { id: String, holder: String },

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("node {0} is not online")]
    NodeOffline(String),

    #[error("node {0} failed its health check")]
    NodeUnhealthy(String),

    #[error("node {0} has no spare task capacity")]
    NodeAtCapacity(String),

    #[error("duplicate shard content on node {node_id} (hash {hash})")]
    DuplicateShardContent { node_id: String, hash: String },

    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("job {job_id} round mismatch: expected {expected}, got {actual}")]
    RoundMismatch {
        job_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("aggregation rejected: {0}")]
    Aggregation(String),

    #[error("reward transfer failed: {0}")]
    Transfer(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Convenience constructor for missing entities.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        OrchestratorError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Convenience constructor for duplicate registrations.
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        OrchestratorError::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// The stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            OrchestratorError::ShardAlreadyAssigned { .. }
            | OrchestratorError::TaskAlreadyAssigned { .. } => ErrorKind::AlreadyAssigned,
            OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            OrchestratorError::NodeOffline(_)
            | OrchestratorError::NodeUnhealthy(_)
            | OrchestratorError::NodeAtCapacity(_)
            | OrchestratorError::DuplicateShardContent { .. }
            | OrchestratorError::NoNodesAvailable
            | OrchestratorError::RoundMismatch { .. }
            | OrchestratorError::Precondition(_) => ErrorKind::Precondition,
            OrchestratorError::Aggregation(_) => ErrorKind::Aggregation,
            OrchestratorError::Transfer(_) | OrchestratorError::Store(_) => ErrorKind::Fatal,
        }
    }

    /// Whether this error must abort the input batch.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

/// Result type alias for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

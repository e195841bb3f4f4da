//! Gradient round coordination for Atlas federated learning.
//!
//! Implements the per-job round protocol:
//!
//! ```text
//! COLLECTING --(quorum | deadline)--> AGGREGATING --> PUBLISHING --> COLLECTING(round+1)
//! ```
//!
//! The deterministic FSM lives in [`coordinator`]; [`service`] wires it to
//! the blob store, the pub/sub network and the replicated input stream;
//! [`workers`] holds the node-side listeners and publishers.

pub mod coordinator;
pub mod metrics;
pub mod service;
pub mod workers;

pub use coordinator::{
    GradientSubmission, RoundAction, RoundConfig, RoundCoordinator, RoundError, RoundPhase,
    RoundState, SubmissionOutcome,
};
pub use metrics::RoundMetrics;
pub use service::{
    decode_gradient, encode_gradient, BlockTick, ContributionSink, RoundControl, RoundService,
    RoundServiceConfig, RoundServiceError, RoundServiceHandles,
};
pub use workers::{announce_gradient, GradientListener, HeartbeatPublisher, RollbackListener};

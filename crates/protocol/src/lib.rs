//! Wire protocol for Atlas federated learning.
//!
//! Defines the pub/sub topic namespace, the JSON payloads carried on each
//! topic, and the transport-neutral [`PubSub`] seam the workers are written
//! against.

pub mod messages;
pub mod pubsub;
pub mod topics;

pub use messages::{GradientAnnouncement, HeartbeatMessage, ModelUpdate, RollbackNotice};
pub use pubsub::{MemoryPubSub, PubSub, PubSubError, PubSubMessage, Subscription};
pub use topics::{
    gradients_topic, heartbeat_topic, model_topic, parse_topic, rollback_topic, Topic,
};

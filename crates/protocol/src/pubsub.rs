//! Pub/sub transport seam.
//!
//! The real gossip network is an external collaborator; the core only
//! needs publish/subscribe over string topics. [`MemoryPubSub`] provides an
//! in-process implementation for tests and single-process deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

/// Channel capacity per topic. Slow subscribers lag rather than block
/// publishers.
const TOPIC_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("publish failed on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe failed on {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Topic the message arrived on.
    pub topic: String,
    /// Raw payload bytes (JSON for all Atlas topics).
    pub data: Vec<u8>,
}

/// Subscription handle yielding messages for one topic.
pub type Subscription = broadcast::Receiver<PubSubMessage>;

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `data` on `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError>;
    /// Subscribe to `topic`, receiving messages published after this call.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError>;
}

/// In-process pub/sub over tokio broadcast channels.
#[derive(Debug, Default)]
pub struct MemoryPubSub {
    topics: RwLock<HashMap<String, broadcast::Sender<PubSubMessage>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<PubSubMessage> {
        let mut topics = self.topics.write().expect("topic lock poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        let message = PubSubMessage {
            topic: topic.to_string(),
            data,
        };
        // A send error only means nobody is subscribed yet; gossip has no
        // delivery guarantee either.
        let _ = self.sender(topic).send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, PubSubError> {
        Ok(self.sender(topic).subscribe())
    }
}

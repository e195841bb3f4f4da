//! Node-side long-running workers.
//!
//! Each worker owns a subscription or a ticker plus a shutdown channel and
//! exits promptly when signalled, discarding in-flight work. These run on
//! nodes, not in the replicated core, so wall-clock time is allowed here.

use crate::service::RoundServiceError;
use atlas_protocol::{
    gradients_topic, heartbeat_topic, rollback_topic, GradientAnnouncement, HeartbeatMessage,
    PubSub, RollbackNotice,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Forwards gradient announcements of one job into the round service.
///
/// Messages that do not parse, or whose embedded job id disagrees with the
/// topic, are dropped and logged.
pub struct GradientListener {
    job_id: String,
    pubsub: Arc<dyn PubSub>,
    announcement_tx: mpsc::Sender<GradientAnnouncement>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl GradientListener {
    pub fn new(
        job_id: String,
        pubsub: Arc<dyn PubSub>,
        announcement_tx: mpsc::Sender<GradientAnnouncement>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            job_id,
            pubsub,
            announcement_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), RoundServiceError> {
        let topic = gradients_topic(&self.job_id);
        let mut subscription = self.pubsub.subscribe(&topic).await?;
        info!(job_id = %self.job_id, topic = %topic, "Gradient listener started");

        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(job_id = %self.job_id, error = %e, "Gradient subscription lagged");
                            continue;
                        }
                    };
                    let announcement: GradientAnnouncement =
                        match serde_json::from_slice(&message.data) {
                            Ok(announcement) => announcement,
                            Err(e) => {
                                debug!(error = %e, "Unparseable gradient announcement dropped");
                                continue;
                            }
                        };
                    if announcement.job_id != self.job_id {
                        debug!(
                            expected = %self.job_id,
                            got = %announcement.job_id,
                            "Announcement for wrong job dropped"
                        );
                        continue;
                    }
                    if self.announcement_tx.send(announcement).await.is_err() {
                        info!(job_id = %self.job_id, "Round service gone, listener exiting");
                        return Ok(());
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(job_id = %self.job_id, "Gradient listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Publishes this node's gradient for a round and announces it.
pub async fn announce_gradient(
    pubsub: &dyn PubSub,
    node_id: &str,
    job_id: &str,
    round: u64,
    gradient_cid: &str,
) -> Result<(), RoundServiceError> {
    let announcement = GradientAnnouncement {
        node_id: node_id.to_string(),
        job_id: job_id.to_string(),
        round,
        gradient_cid: gradient_cid.to_string(),
        ts: unix_now_ns(),
    };
    let payload = serde_json::to_vec(&announcement)
        .map_err(|e| RoundServiceError::Sink(e.to_string()))?;
    pubsub.publish(&gradients_topic(job_id), payload).await?;
    Ok(())
}

/// Periodically publishes a liveness beacon on this node's heartbeat
/// topic.
pub struct HeartbeatPublisher {
    node_id: String,
    pubsub: Arc<dyn PubSub>,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

impl HeartbeatPublisher {
    pub fn new(
        node_id: String,
        pubsub: Arc<dyn PubSub>,
        interval: Duration,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            node_id,
            pubsub,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), RoundServiceError> {
        let topic = heartbeat_topic(&self.node_id);
        let mut ticker = tokio::time::interval(self.interval);
        info!(node_id = %self.node_id, "Heartbeat publisher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let message = HeartbeatMessage {
                        node_id: self.node_id.clone(),
                        ts: unix_now_ns(),
                    };
                    let payload = serde_json::to_vec(&message)
                        .map_err(|e| RoundServiceError::Sink(e.to_string()))?;
                    if let Err(e) = self.pubsub.publish(&topic, payload).await {
                        warn!(node_id = %self.node_id, error = %e, "Heartbeat publish failed");
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(node_id = %self.node_id, "Heartbeat publisher stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Forwards rollback notices of one job to the node-local executor, which
/// stops the named task and discards its scratch state.
pub struct RollbackListener {
    job_id: String,
    pubsub: Arc<dyn PubSub>,
    notice_tx: mpsc::Sender<RollbackNotice>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RollbackListener {
    pub fn new(
        job_id: String,
        pubsub: Arc<dyn PubSub>,
        notice_tx: mpsc::Sender<RollbackNotice>,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            job_id,
            pubsub,
            notice_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<(), RoundServiceError> {
        let topic = rollback_topic(&self.job_id);
        let mut subscription = self.pubsub.subscribe(&topic).await?;
        info!(job_id = %self.job_id, "Rollback listener started");

        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(job_id = %self.job_id, error = %e, "Rollback subscription lagged");
                            continue;
                        }
                    };
                    match serde_json::from_slice::<RollbackNotice>(&message.data) {
                        Ok(notice) => {
                            if self.notice_tx.send(notice).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Unparseable rollback notice dropped");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(job_id = %self.job_id, "Rollback listener stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_protocol::MemoryPubSub;

    #[tokio::test]
    async fn test_gradient_listener_forwards_matching_job() {
        let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let (announcement_tx, mut announcement_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let listener = GradientListener::new(
            "job-1".to_string(),
            pubsub.clone(),
            announcement_tx,
            shutdown_rx,
        );
        let handle = tokio::spawn(listener.run());
        tokio::task::yield_now().await;

        announce_gradient(pubsub.as_ref(), "n1", "job-1", 0, "cid-g")
            .await
            .unwrap();

        let received = announcement_rx.recv().await.unwrap();
        assert_eq!(received.node_id, "n1");
        assert_eq!(received.round, 0);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gradient_listener_drops_garbage() {
        let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let (announcement_tx, mut announcement_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let listener = GradientListener::new(
            "job-1".to_string(),
            pubsub.clone(),
            announcement_tx,
            shutdown_rx,
        );
        let handle = tokio::spawn(listener.run());
        tokio::task::yield_now().await;

        pubsub
            .publish(&gradients_topic("job-1"), b"not json".to_vec())
            .await
            .unwrap();
        announce_gradient(pubsub.as_ref(), "n1", "job-1", 0, "cid-ok")
            .await
            .unwrap();

        // Only the valid announcement comes through.
        let received = announcement_rx.recv().await.unwrap();
        assert_eq!(received.gradient_cid, "cid-ok");

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_publisher_emits_and_stops() {
        let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let mut subscription = pubsub.subscribe(&heartbeat_topic("n1")).await.unwrap();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let publisher = HeartbeatPublisher::new(
            "n1".to_string(),
            pubsub.clone(),
            Duration::from_millis(5),
            shutdown_rx,
        );
        let handle = tokio::spawn(publisher.run());

        let message = subscription.recv().await.unwrap();
        let beat: HeartbeatMessage = serde_json::from_slice(&message.data).unwrap();
        assert_eq!(beat.node_id, "n1");

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rollback_listener_forwards_notices() {
        let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let (notice_tx, mut notice_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let listener =
            RollbackListener::new("job-1".to_string(), pubsub.clone(), notice_tx, shutdown_rx);
        let handle = tokio::spawn(listener.run());
        tokio::task::yield_now().await;

        let notice = RollbackNotice {
            task_id: "task-1".to_string(),
            node_id: "n1".to_string(),
            ts: 7,
        };
        pubsub
            .publish(
                &rollback_topic("job-1"),
                serde_json::to_vec(&notice).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(notice_rx.recv().await.unwrap(), notice);

        shutdown_tx.send(()).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}

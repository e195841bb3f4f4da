//! Round service: the off-core worker wiring around the round FSM.
//!
//! Consumes gradient announcements and block ticks, drives the
//! [`RoundCoordinator`], runs aggregation over blob-store gradients,
//! publishes aggregates, and enqueues idempotent replicated inputs through
//! a [`ContributionSink`]. The replicated round advance happens on the
//! other side of the sink; this service only proposes it.

use crate::coordinator::{
    GradientSubmission, RoundAction, RoundConfig, RoundCoordinator, RoundError, SubmissionOutcome,
};
use crate::metrics::RoundMetrics;
use async_trait::async_trait;
use atlas_aggregation::{federated_averaging, validate_aggregation, AggregationError};
use atlas_protocol::{model_topic, GradientAnnouncement, ModelUpdate, PubSub, PubSubError};
use atlas_storage::{BlobStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Encode a gradient vector for blob storage.
pub fn encode_gradient(gradient: &[f64]) -> Vec<u8> {
    serde_json::to_vec(gradient).expect("gradient vectors always serialize")
}

/// Decode a gradient vector fetched from blob storage.
pub fn decode_gradient(bytes: &[u8]) -> Result<Vec<f64>, RoundServiceError> {
    serde_json::from_slice(bytes)
        .map_err(|e| RoundServiceError::GradientDecode(e.to_string()))
}

#[derive(Debug, Error)]
pub enum RoundServiceError {
    #[error("round error: {0}")]
    Round(#[from] RoundError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("publish error: {0}")]
    Publish(#[from] PubSubError),

    #[error("gradient decode failed: {0}")]
    GradientDecode(String),

    #[error("sink error: {0}")]
    Sink(String),
}

/// Replicated-input sink.
///
/// Implementations enqueue the corresponding transaction into the ordered
/// input stream; duplicates are dropped by the state machine, so resending
/// is safe.
#[async_trait]
pub trait ContributionSink: Send + Sync {
    /// Register an accepted gradient contribution.
    async fn register_contribution(
        &self,
        job_id: &str,
        round: u64,
        node_id: &str,
        gradient_cid: &str,
        weight: f64,
    ) -> Result<(), String>;

    /// Propose the round advance with the produced aggregate.
    async fn complete_round(
        &self,
        job_id: &str,
        round: u64,
        aggregate_cid: &str,
    ) -> Result<(), String>;

    /// Report a failed round (deadline with nothing received).
    async fn fail_round(&self, job_id: &str, round: u64) -> Result<(), String>;
}

/// A block-time tick from the node's chain view.
#[derive(Debug, Clone, Copy)]
pub struct BlockTick {
    /// Block time in nanoseconds.
    pub now_ns: u64,
}

/// Control inputs for a running service.
#[derive(Debug, Clone)]
pub enum RoundControl {
    /// Begin coordinating rounds for a job.
    StartJob {
        job_id: String,
        participants: Vec<String>,
        now_ns: u64,
        deadline_override_ns: Option<u64>,
    },
    /// Stop tracking a job.
    StopJob { job_id: String },
}

/// Configuration for the round service.
#[derive(Debug, Clone)]
pub struct RoundServiceConfig {
    /// Round FSM tunables.
    pub round: RoundConfig,
    /// Buffer size of the announcement and tick channels.
    pub channel_capacity: usize,
}

impl Default for RoundServiceConfig {
    fn default() -> Self {
        Self {
            round: RoundConfig::default(),
            channel_capacity: 256,
        }
    }
}

/// Input channels handed to the listeners feeding a [`RoundService`].
pub struct RoundServiceHandles {
    /// Send half for gradient announcements.
    pub announcement_tx: mpsc::Sender<GradientAnnouncement>,
    /// Send half for block ticks.
    pub tick_tx: mpsc::Sender<BlockTick>,
    /// Send half for control inputs.
    pub control_tx: mpsc::Sender<RoundControl>,
    /// Send half for shutdown.
    pub shutdown_tx: mpsc::Sender<()>,
}

/// Event-driven round orchestration worker.
pub struct RoundService {
    coordinator: RoundCoordinator,
    blobs: Arc<dyn BlobStore>,
    pubsub: Arc<dyn PubSub>,
    sink: Arc<dyn ContributionSink>,
    metrics: Option<Arc<RoundMetrics>>,
    announcement_rx: mpsc::Receiver<GradientAnnouncement>,
    tick_rx: mpsc::Receiver<BlockTick>,
    control_rx: mpsc::Receiver<RoundControl>,
    shutdown_rx: mpsc::Receiver<()>,
    last_block_ns: u64,
}

impl RoundService {
    /// Create a service and the channel handles that feed it.
    pub fn new(
        config: RoundServiceConfig,
        blobs: Arc<dyn BlobStore>,
        pubsub: Arc<dyn PubSub>,
        sink: Arc<dyn ContributionSink>,
    ) -> (Self, RoundServiceHandles) {
        let (announcement_tx, announcement_rx) = mpsc::channel(config.channel_capacity);
        let (tick_tx, tick_rx) = mpsc::channel(config.channel_capacity);
        let (control_tx, control_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let service = Self {
            coordinator: RoundCoordinator::new(config.round),
            blobs,
            pubsub,
            sink,
            metrics: None,
            announcement_rx,
            tick_rx,
            control_rx,
            shutdown_rx,
            last_block_ns: 0,
        };
        let handles = RoundServiceHandles {
            announcement_tx,
            tick_tx,
            control_tx,
            shutdown_tx,
        };
        (service, handles)
    }

    /// Attach round metrics.
    pub fn with_metrics(mut self, metrics: Arc<RoundMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Begin coordinating rounds for a job.
    pub fn start_job(
        &mut self,
        job_id: &str,
        participants: Vec<String>,
        now_ns: u64,
        deadline_override_ns: Option<u64>,
    ) -> Result<(), RoundError> {
        self.coordinator
            .start_job(job_id, participants, now_ns, deadline_override_ns)?;
        info!(job_id = %job_id, "Round coordination started");
        Ok(())
    }

    /// Current round of a tracked job.
    pub fn current_round(&self, job_id: &str) -> Option<u64> {
        self.coordinator.job_state(job_id).map(|s| s.round)
    }

    /// Run until shutdown. In-flight work is discarded on exit.
    pub async fn run(&mut self) -> Result<(), RoundServiceError> {
        info!("Round service started");
        loop {
            tokio::select! {
                Some(announcement) = self.announcement_rx.recv() => {
                    if let Err(e) = self.handle_announcement(announcement).await {
                        warn!(error = %e, "Failed to handle gradient announcement");
                    }
                }
                Some(tick) = self.tick_rx.recv() => {
                    if let Err(e) = self.handle_tick(tick).await {
                        warn!(error = %e, "Failed to handle block tick");
                    }
                }
                Some(control) = self.control_rx.recv() => {
                    if let Err(e) = self.handle_control(control) {
                        warn!(error = %e, "Failed to handle control input");
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Round service stopping");
                    return Ok(());
                }
                else => return Ok(()),
            }
        }
    }

    /// Apply one control input.
    pub fn handle_control(&mut self, control: RoundControl) -> Result<(), RoundError> {
        match control {
            RoundControl::StartJob {
                job_id,
                participants,
                now_ns,
                deadline_override_ns,
            } => self.start_job(&job_id, participants, now_ns, deadline_override_ns),
            RoundControl::StopJob { job_id } => {
                self.coordinator.stop_job(&job_id);
                Ok(())
            }
        }
    }

    /// Feed one announcement through the FSM.
    pub async fn handle_announcement(
        &mut self,
        announcement: GradientAnnouncement,
    ) -> Result<(), RoundServiceError> {
        let outcome = match self.coordinator.submit(
            &announcement.job_id,
            announcement.round,
            &announcement.node_id,
            &announcement.gradient_cid,
            1.0,
        ) {
            Ok(outcome) => outcome,
            Err(RoundError::UnknownJob(job_id)) => {
                debug!(job_id = %job_id, "Announcement for untracked job dropped");
                self.record_submission("untracked");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match &outcome {
            SubmissionOutcome::Accepted { received, quorum } => {
                self.record_submission("accepted");
                debug!(
                    job_id = %announcement.job_id,
                    node_id = %announcement.node_id,
                    round = announcement.round,
                    received = received,
                    quorum = quorum,
                    "Gradient accepted"
                );
                self.sink
                    .register_contribution(
                        &announcement.job_id,
                        announcement.round,
                        &announcement.node_id,
                        &announcement.gradient_cid,
                        1.0,
                    )
                    .await
                    .map_err(RoundServiceError::Sink)?;
                // Quorum may be complete without waiting for the next tick.
                self.advance_job(announcement.job_id.clone()).await?;
            }
            other => {
                self.record_submission("rejected");
                debug!(
                    job_id = %announcement.job_id,
                    node_id = %announcement.node_id,
                    round = announcement.round,
                    outcome = ?other,
                    "Gradient dropped"
                );
            }
        }
        Ok(())
    }

    /// Advance every tracked job against a new block time.
    pub async fn handle_tick(&mut self, tick: BlockTick) -> Result<(), RoundServiceError> {
        self.last_block_ns = tick.now_ns;
        for job_id in self.coordinator.tracked_jobs() {
            self.advance_job(job_id).await?;
        }
        Ok(())
    }

    async fn advance_job(&mut self, job_id: String) -> Result<(), RoundServiceError> {
        let action = match self.coordinator.poll(&job_id, self.last_block_ns) {
            Ok(Some(action)) => action,
            Ok(None) => return Ok(()),
            Err(RoundError::UnknownJob(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match action {
            RoundAction::Aggregate {
                job_id,
                round,
                submissions,
            } => self.run_aggregation(&job_id, round, submissions).await,
            RoundAction::FailRound { job_id, round } => {
                warn!(job_id = %job_id, round = round, "Round deadline with no submissions");
                if let Some(metrics) = &self.metrics {
                    metrics.rounds_failed_total.inc();
                }
                self.sink
                    .fail_round(&job_id, round)
                    .await
                    .map_err(RoundServiceError::Sink)?;
                self.coordinator.stop_job(&job_id);
                Ok(())
            }
        }
    }

    async fn run_aggregation(
        &mut self,
        job_id: &str,
        round: u64,
        submissions: Vec<GradientSubmission>,
    ) -> Result<(), RoundServiceError> {
        let _timer = self
            .metrics
            .as_ref()
            .map(|m| m.aggregation_duration_seconds.start_timer());

        let mut gradients = Vec::with_capacity(submissions.len());
        let mut weights = Vec::with_capacity(submissions.len());
        let mut input_cids = Vec::with_capacity(submissions.len());
        for submission in &submissions {
            let bytes = self.blobs.get(&submission.gradient_cid).await?;
            gradients.push(decode_gradient(&bytes)?);
            weights.push(submission.weight);
            input_cids.push(submission.gradient_cid.clone());
        }

        validate_aggregation(&gradients)?;
        let aggregate = federated_averaging(&gradients, Some(&weights))?;
        let aggregate_cid = self.blobs.put(&encode_gradient(&aggregate)).await?;

        // The FSM re-checks that these inputs are still the frozen set.
        self.coordinator
            .complete_aggregation(job_id, round, &input_cids)?;

        let update = ModelUpdate {
            round,
            aggregate_cid: aggregate_cid.clone(),
            ts: self.last_block_ns,
        };
        let payload = serde_json::to_vec(&update)
            .map_err(|e| RoundServiceError::Sink(e.to_string()))?;
        self.pubsub.publish(&model_topic(job_id), payload).await?;

        self.coordinator
            .confirm_published(job_id, round, self.last_block_ns)?;
        self.sink
            .complete_round(job_id, round, &aggregate_cid)
            .await
            .map_err(RoundServiceError::Sink)?;

        if let Some(metrics) = &self.metrics {
            metrics.rounds_completed_total.inc();
        }
        info!(
            job_id = %job_id,
            round = round,
            contributors = submissions.len(),
            aggregate_cid = %aggregate_cid,
            "Round completed"
        );
        Ok(())
    }

    fn record_submission(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.submissions_total.with_label_values(&[outcome]).inc();
        }
    }
}

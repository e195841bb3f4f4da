//! Round coordination Prometheus metrics

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Round protocol metrics collection
pub struct RoundMetrics {
    /// Gradient rounds completed
    pub rounds_completed_total: IntCounter,

    /// Gradient rounds failed at the deadline
    pub rounds_failed_total: IntCounter,

    /// Gradient submissions by outcome (accepted, rejected, untracked)
    pub submissions_total: IntCounterVec,

    /// Time spent aggregating a round
    pub aggregation_duration_seconds: Histogram,

    /// Prometheus registry for this metrics instance
    pub registry: Registry,
}

impl RoundMetrics {
    /// Create round metrics with a dedicated registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("atlas_rounds".to_string()), None)?;

        let rounds_completed_total =
            IntCounter::new("completed_total", "Gradient rounds completed")?;
        registry.register(Box::new(rounds_completed_total.clone()))?;

        let rounds_failed_total =
            IntCounter::new("failed_total", "Gradient rounds failed at the deadline")?;
        registry.register(Box::new(rounds_failed_total.clone()))?;

        let submissions_total = IntCounterVec::new(
            Opts::new("submissions_total", "Gradient submissions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        let aggregation_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "aggregation_duration_seconds",
            "Time spent aggregating a round in seconds",
        ))?;
        registry.register(Box::new(aggregation_duration_seconds.clone()))?;

        Ok(Self {
            rounds_completed_total,
            rounds_failed_total,
            submissions_total,
            aggregation_duration_seconds,
            registry,
        })
    }
}

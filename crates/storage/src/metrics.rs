//! Blob storage Prometheus metrics
//!
//! Tracks the artifact traffic a node's blob store handles: how many
//! blobs and bytes move in each direction, fetch latency (the hot path
//! during round aggregation), misses, detected corruption, and dataset
//! splitting activity.

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

/// Blob storage metrics collection
#[derive(Debug)]
pub struct StorageMetrics {
    /// Blobs written successfully
    pub blobs_stored_total: IntCounter,

    /// Payload bytes written
    pub bytes_stored_total: IntCounter,

    /// Blobs fetched successfully
    pub blobs_fetched_total: IntCounter,

    /// Payload bytes read
    pub bytes_fetched_total: IntCounter,

    /// Fetches of CIDs not present in the store
    pub fetch_misses_total: IntCounter,

    /// Blobs whose content no longer matched their CID
    pub corrupt_blobs_total: IntCounter,

    /// Datasets split into shards
    pub datasets_split_total: IntCounter,

    /// Shards produced by dataset splitting
    pub shards_produced_total: IntCounter,

    /// Blob fetch latency
    pub fetch_duration_seconds: Histogram,

    /// Prometheus registry for this metrics instance
    pub registry: Registry,
}

impl StorageMetrics {
    /// Create storage metrics with a dedicated registry.
    ///
    /// A per-instance registry keeps parallel tests and multiple stores in
    /// one process from colliding on metric names.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("atlas_storage".to_string()), None)?;

        let blobs_stored_total =
            IntCounter::new("blobs_stored_total", "Blobs written successfully")?;
        registry.register(Box::new(blobs_stored_total.clone()))?;

        let bytes_stored_total =
            IntCounter::new("bytes_stored_total", "Payload bytes written")?;
        registry.register(Box::new(bytes_stored_total.clone()))?;

        let blobs_fetched_total =
            IntCounter::new("blobs_fetched_total", "Blobs fetched successfully")?;
        registry.register(Box::new(blobs_fetched_total.clone()))?;

        let bytes_fetched_total =
            IntCounter::new("bytes_fetched_total", "Payload bytes read")?;
        registry.register(Box::new(bytes_fetched_total.clone()))?;

        let fetch_misses_total = IntCounter::new(
            "fetch_misses_total",
            "Fetches of CIDs not present in the store",
        )?;
        registry.register(Box::new(fetch_misses_total.clone()))?;

        let corrupt_blobs_total = IntCounter::new(
            "corrupt_blobs_total",
            "Blobs whose content no longer matched their CID",
        )?;
        registry.register(Box::new(corrupt_blobs_total.clone()))?;

        let datasets_split_total =
            IntCounter::new("datasets_split_total", "Datasets split into shards")?;
        registry.register(Box::new(datasets_split_total.clone()))?;

        let shards_produced_total = IntCounter::new(
            "shards_produced_total",
            "Shards produced by dataset splitting",
        )?;
        registry.register(Box::new(shards_produced_total.clone()))?;

        let fetch_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "fetch_duration_seconds",
            "Blob fetch latency in seconds",
        ))?;
        registry.register(Box::new(fetch_duration_seconds.clone()))?;

        Ok(Self {
            blobs_stored_total,
            bytes_stored_total,
            blobs_fetched_total,
            bytes_fetched_total,
            fetch_misses_total,
            corrupt_blobs_total,
            datasets_split_total,
            shards_produced_total,
            fetch_duration_seconds,
            registry,
        })
    }

    /// Record a successful write of `bytes` payload bytes.
    pub fn record_store(&self, bytes: usize) {
        self.blobs_stored_total.inc();
        self.bytes_stored_total.inc_by(bytes as u64);
    }

    /// Record a successful read of `bytes` payload bytes.
    pub fn record_fetch(&self, bytes: usize) {
        self.blobs_fetched_total.inc();
        self.bytes_fetched_total.inc_by(bytes as u64);
    }

    /// Record a dataset split into `shards` pieces.
    pub fn record_split(&self, shards: usize) {
        self.datasets_split_total.inc();
        self.shards_produced_total.inc_by(shards as u64);
    }
}

//! Content-addressed blob storage for Atlas nodes.
//!
//! Provides a pluggable [`BlobStore`] interface with in-memory and local
//! filesystem implementations, dataset splitting helpers, and storage
//! metrics. Blobs are immutable and addressed by the hex SHA-256 of their
//! contents; the rest of the system treats CIDs as opaque strings.

mod local;
mod memory;
mod metrics;
mod split;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use metrics::{MetricsError, StorageMetrics};
pub use split::{split_dataset, DatasetShard};

/// Content identifier type alias.
pub type Cid = String;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("blob not found: {0}")]
    NotFound(Cid),

    #[error("CID mismatch: expected {expected}, got {actual}")]
    CidMismatch { expected: String, actual: String },

    #[error("invalid shard count: {0}")]
    InvalidShardCount(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Hex SHA-256 of `data`; doubles as the content identifier.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `data` hashes to `expected`. An empty expectation never matches.
pub fn verify_hash(data: &[u8], expected: &str) -> bool {
    !expected.is_empty() && content_hash(data) == expected
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data`, returning its content identifier.
    async fn put(&self, data: &[u8]) -> Result<Cid, StorageError>;
    /// Fetch the blob addressed by `cid`.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError>;
    /// Whether a blob for `cid` is present.
    async fn has(&self, cid: &Cid) -> Result<bool, StorageError>;
}

/// Backend selection for [`BlobManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlobBackendConfig {
    Memory,
    Local { root: PathBuf },
}

/// One shard of a dataset persisted through [`BlobManager::store_dataset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredShard {
    /// Zero-based shard index within the dataset.
    pub index: usize,
    /// Content address of the stored shard.
    pub cid: Cid,
    /// Hex SHA-256 of the shard bytes.
    pub hash: String,
    /// Shard size in bytes.
    pub size: u64,
}

/// Blob store facade tracking the artifact traffic of one node.
///
/// Puts and gets count blobs and payload bytes; failed gets are classified
/// as misses or corruption. Presence checks are passthrough.
#[derive(Clone)]
pub struct BlobManager {
    backend: Arc<dyn BlobStore>,
    metrics: Option<Arc<StorageMetrics>>,
}

impl BlobManager {
    pub fn new(config: BlobBackendConfig) -> Result<Self, StorageError> {
        let backend: Arc<dyn BlobStore> = match config {
            BlobBackendConfig::Memory => Arc::new(MemoryBlobStore::new()),
            BlobBackendConfig::Local { root } => Arc::new(LocalBlobStore::new(root)?),
        };
        Ok(Self {
            backend,
            metrics: None,
        })
    }

    pub fn memory() -> Self {
        Self {
            backend: Arc::new(MemoryBlobStore::new()),
            metrics: None,
        }
    }

    pub fn local(root: PathBuf) -> Result<Self, StorageError> {
        Self::new(BlobBackendConfig::Local { root })
    }

    /// Attach storage metrics.
    pub fn with_metrics(mut self, metrics: Arc<StorageMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> Arc<dyn BlobStore> {
        self.backend.clone()
    }

    pub async fn put(&self, data: &[u8]) -> Result<Cid, StorageError> {
        let cid = self.backend.put(data).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_store(data.len());
        }
        Ok(cid)
    }

    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError> {
        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.fetch_duration_seconds.start_timer());

        match self.backend.get(cid).await {
            Ok(data) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_fetch(data.len());
                }
                Ok(data)
            }
            Err(e) => {
                // Failed fetches do not belong in the latency histogram.
                if let Some(timer) = timer {
                    timer.stop_and_discard();
                }
                if let Some(metrics) = &self.metrics {
                    match &e {
                        StorageError::NotFound(_) => metrics.fetch_misses_total.inc(),
                        StorageError::CidMismatch { .. } => metrics.corrupt_blobs_total.inc(),
                        _ => {}
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        self.backend.has(cid).await
    }

    /// Split a dataset into `num_shards` pieces and store each one.
    ///
    /// Returns the stored shards in index order, carrying the CID, content
    /// hash and size the orchestrator needs to register them.
    pub async fn store_dataset(
        &self,
        data: &[u8],
        num_shards: usize,
    ) -> Result<Vec<StoredShard>, StorageError> {
        let shards = split_dataset(data, num_shards)?;

        let mut stored = Vec::with_capacity(shards.len());
        for shard in shards {
            let cid = self.put(&shard.data).await?;
            stored.push(StoredShard {
                index: shard.index,
                cid,
                hash: shard.hash,
                size: shard.data.len() as u64,
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_split(stored.len());
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_put_get_has() {
        let manager = BlobManager::memory();
        let cid = manager.put(b"gradient bytes").await.expect("put");

        assert!(manager.has(&cid).await.expect("has"));
        let fetched = manager.get(&cid).await.expect("get");
        assert_eq!(fetched, b"gradient bytes");

        let missing = "0".repeat(64);
        assert!(!manager.has(&missing).await.expect("has"));
        assert!(matches!(
            manager.get(&missing).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_put_get() {
        let temp_dir = TempDir::new().expect("temp dir");
        let manager = BlobManager::local(temp_dir.path().to_path_buf()).expect("manager");

        let cid = manager.put(b"dataset shard").await.expect("put");
        assert_eq!(cid, content_hash(b"dataset shard"));

        let fetched = manager.get(&cid).await.expect("get");
        assert_eq!(fetched, b"dataset shard");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let manager = BlobManager::memory();
        let first = manager.put(b"same").await.expect("put");
        let second = manager.put(b"same").await.expect("put");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_store_dataset_accounts_traffic() {
        let metrics = Arc::new(StorageMetrics::new().expect("metrics"));
        let manager = BlobManager::memory().with_metrics(metrics.clone());

        // 300 dataset bytes split three ways.
        let dataset: Vec<u8> = (0..300).map(|i| (i % 7) as u8).collect();
        let stored = manager.store_dataset(&dataset, 3).await.expect("store");
        assert_eq!(stored.len(), 3);

        // Every shard round-trips and matches its recorded hash.
        for shard in &stored {
            let data = manager.get(&shard.cid).await.expect("get");
            assert_eq!(content_hash(&data), shard.hash);
            assert_eq!(data.len() as u64, shard.size);
        }

        assert_eq!(metrics.datasets_split_total.get(), 1);
        assert_eq!(metrics.shards_produced_total.get(), 3);
        assert_eq!(metrics.blobs_stored_total.get(), 3);
        assert_eq!(metrics.bytes_stored_total.get(), 300);
        assert_eq!(metrics.blobs_fetched_total.get(), 3);
        assert_eq!(metrics.bytes_fetched_total.get(), 300);
    }

    #[tokio::test]
    async fn test_misses_and_corruption_classified() {
        let temp_dir = TempDir::new().expect("temp dir");
        let metrics = Arc::new(StorageMetrics::new().expect("metrics"));
        let manager = BlobManager::local(temp_dir.path().to_path_buf())
            .expect("manager")
            .with_metrics(metrics.clone());

        let cid = manager.put(b"intact").await.expect("put");

        // Absent CID counts as a miss, not corruption.
        let missing = "f".repeat(64);
        assert!(manager.get(&missing).await.is_err());
        assert_eq!(metrics.fetch_misses_total.get(), 1);
        assert_eq!(metrics.corrupt_blobs_total.get(), 0);

        // A tampered blob counts as corruption.
        tokio::fs::write(temp_dir.path().join(&cid).join("data.bin"), b"tampered")
            .await
            .expect("overwrite");
        assert!(matches!(
            manager.get(&cid).await,
            Err(StorageError::CidMismatch { .. })
        ));
        assert_eq!(metrics.corrupt_blobs_total.get(), 1);

        // Nothing was counted as a successful fetch.
        assert_eq!(metrics.blobs_fetched_total.get(), 0);
    }

    #[test]
    fn test_verify_hash() {
        let hash = content_hash(b"payload");
        assert!(verify_hash(b"payload", &hash));
        assert!(!verify_hash(b"payload!", &hash));
        assert!(!verify_hash(b"payload", ""));
    }
}

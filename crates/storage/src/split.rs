//! Dataset splitting.
//!
//! Splits a dataset byte-wise into a fixed number of shards, each carrying
//! its own content hash. Interpretation of the bytes (record boundaries,
//! formats) is left to the node-local executor.

use crate::{content_hash, StorageError};

/// One shard of a split dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetShard {
    /// Zero-based shard index.
    pub index: usize,
    /// Shard bytes.
    pub data: Vec<u8>,
    /// Hex SHA-256 of the shard bytes.
    pub hash: String,
}

/// Split `data` into `num_shards` contiguous shards.
///
/// Shard sizes differ by at most one byte; earlier shards take the
/// remainder. Fails when `num_shards` is zero or exceeds the dataset
/// length.
pub fn split_dataset(data: &[u8], num_shards: usize) -> Result<Vec<DatasetShard>, StorageError> {
    if num_shards == 0 || num_shards > data.len() {
        return Err(StorageError::InvalidShardCount(num_shards));
    }

    let base = data.len() / num_shards;
    let remainder = data.len() % num_shards;

    let mut shards = Vec::with_capacity(num_shards);
    let mut offset = 0;
    for index in 0..num_shards {
        let len = base + usize::from(index < remainder);
        let chunk = &data[offset..offset + len];
        shards.push(DatasetShard {
            index,
            data: chunk.to_vec(),
            hash: content_hash(chunk),
        });
        offset += len;
    }

    Ok(shards)
}

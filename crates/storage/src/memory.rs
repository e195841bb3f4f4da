use crate::{content_hash, BlobStore, Cid, StorageError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory blob store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("blob lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> Result<Cid, StorageError> {
        let cid = content_hash(data);
        self.blobs
            .write()
            .expect("blob lock poisoned")
            .insert(cid.clone(), data.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .expect("blob lock poisoned")
            .get(cid)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(cid.clone()))
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        Ok(self
            .blobs
            .read()
            .expect("blob lock poisoned")
            .contains_key(cid))
    }
}

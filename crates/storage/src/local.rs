use crate::{content_hash, BlobStore, Cid, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Filesystem-backed blob store rooted at a directory.
///
/// Each blob lives under `<root>/<cid>/data.bin`, written through a
/// temporary file and renamed so readers never observe partial blobs.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Result<Self, StorageError> {
        if root.as_os_str().is_empty() {
            return Err(StorageError::Backend("storage root is empty".to_string()));
        }
        Ok(Self { root })
    }

    fn validate_cid(&self, cid: &Cid) -> Result<(), StorageError> {
        let valid = !cid.is_empty()
            && cid.len() == 64
            && cid.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(StorageError::InvalidCid(cid.clone()));
        }
        Ok(())
    }

    fn data_path(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid).join("data.bin")
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, data: &[u8]) -> Result<Cid, StorageError> {
        let cid = content_hash(data);
        let target = self.data_path(&cid);
        let temp = target.with_extension("tmp");

        Self::ensure_parent(&target).await?;

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&temp, &target).await?;
        Ok(cid)
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StorageError> {
        self.validate_cid(cid)?;
        let path = self.data_path(cid);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(cid.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        // Content addressing means a corrupted file no longer matches its
        // own name.
        let actual = content_hash(&data);
        if &actual != cid {
            return Err(StorageError::CidMismatch {
                expected: cid.clone(),
                actual,
            });
        }
        Ok(data)
    }

    async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        self.validate_cid(cid)?;
        Ok(tokio::fs::metadata(self.data_path(cid)).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_roundtrip_and_has() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(temp_dir.path().to_path_buf()).expect("store");

        let cid = store.put(b"bytes on disk").await.expect("put");
        assert!(store.has(&cid).await.expect("has"));
        assert_eq!(store.get(&cid).await.expect("get"), b"bytes on disk");
    }

    #[tokio::test]
    async fn test_rejects_malformed_cid() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(temp_dir.path().to_path_buf()).expect("store");

        let result = store.get(&"../escape".to_string()).await;
        assert!(matches!(result, Err(StorageError::InvalidCid(_))));
    }

    #[tokio::test]
    async fn test_detects_corruption() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = LocalBlobStore::new(temp_dir.path().to_path_buf()).expect("store");

        let cid = store.put(b"original").await.expect("put");
        tokio::fs::write(temp_dir.path().join(&cid).join("data.bin"), b"tampered")
            .await
            .expect("overwrite");

        let result = store.get(&cid).await;
        assert!(matches!(result, Err(StorageError::CidMismatch { .. })));
    }
}

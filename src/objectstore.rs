//! Content-addressed blob storage seam.
//!
//! The core only needs put/get over opaque references; the production
//! object-store wrapper lives outside this repo and implements the same
//! trait. The filesystem backend here serves dev and tests.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::BlobConfig;
use crate::error::BlobError;

/// Store for audio inputs, stage outputs, and final transcripts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes; returns a content-addressed reference.
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobError>;

    async fn get(&self, reference: &str) -> Result<Vec<u8>, BlobError>;
}

/// Filesystem-backed store addressing blobs by SHA-256.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(config: &BlobConfig) -> Self {
        Self {
            root: config.root.clone(),
        }
    }

    fn path_for(&self, reference: &str) -> PathBuf {
        self.root.join(reference.trim_start_matches("blob:"))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let digest = hex::encode(Sha256::digest(bytes));
        let reference = format!("blob:{}", digest);
        let path = self.path_for(&reference);

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            // Content-addressed: same bytes, same blob.
            return Ok(reference);
        }
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(reference)
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(reference);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (FsObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(&BlobConfig {
            root: dir.path().to_path_buf(),
        });
        (store, dir)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (store, _dir) = store();
        let reference = store.put(b"hello world").await.unwrap();
        assert!(reference.starts_with("blob:"));
        assert_eq!(store.get(&reference).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn identical_content_shares_a_reference() {
        let (store, _dir) = store();
        let a = store.put(b"same bytes").await.unwrap();
        let b = store.put(b"same bytes").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let (store, _dir) = store();
        let err = store.get("blob:does-not-exist").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound(_)));
    }
}

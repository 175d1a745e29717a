//! External row-body storage.
//!
//! The indices never embed row bytes. The primary index of a table maps a
//! key to the content hash of the row body held here; payloads are
//! arbitrary-length blobs addressed, like chunks, by their SHA-256 digest.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::chunk::ChunkHash;
use crate::error::ChunkDbError;

/// Content-addressed blob store for row bodies.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Durably store `bytes` and return their content hash.
    async fn put(&self, bytes: &[u8]) -> Result<ChunkHash>;

    /// Fetch the payload stored under `hash`.
    async fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>>;
}

/// One file per payload under a directory, named by the hex hash.
#[derive(Debug)]
pub struct DirectoryPayloadStore {
    dir: PathBuf,
}

impl DirectoryPayloadStore {
    /// Open a payload directory, creating it if needed.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn payload_path(&self, hash: &ChunkHash) -> PathBuf {
        self.dir.join(hash.to_string())
    }
}

#[async_trait]
impl PayloadStore for DirectoryPayloadStore {
    async fn put(&self, bytes: &[u8]) -> Result<ChunkHash> {
        let hash = ChunkHash::digest(bytes);
        let path = self.payload_path(&hash);
        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(hash)
    }

    async fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        match tokio::fs::read(self.payload_path(hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ChunkDbError::ChunkNotFound(*hash).into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory payload store for tests.
#[derive(Debug, Default)]
pub struct MemoryPayloadStore {
    payloads: RwLock<HashMap<ChunkHash, Vec<u8>>>,
}

impl MemoryPayloadStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, bytes: &[u8]) -> Result<ChunkHash> {
        let hash = ChunkHash::digest(bytes);
        self.payloads
            .write()
            .await
            .entry(hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    async fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        match self.payloads.read().await.get(hash) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(ChunkDbError::ChunkNotFound(*hash).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_round_trips_payloads() {
        let store = MemoryPayloadStore::new();
        let hash = store.put(b"a row body of any length").await.expect("puts");
        assert_eq!(
            b"a row body of any length".to_vec(),
            store.get(&hash).await.expect("gets")
        );
    }

    #[tokio::test]
    async fn it_round_trips_directory_payloads() {
        let store = DirectoryPayloadStore::open("payload_roundtrip.db")
            .await
            .expect("opens store");
        let hash = store.put(b"persisted body").await.expect("puts");
        assert_eq!(
            b"persisted body".to_vec(),
            store.get(&hash).await.expect("gets")
        );
        std::fs::remove_dir_all("payload_roundtrip.db").expect("cleanup");
    }

    #[tokio::test]
    async fn it_reports_missing_payloads() {
        let store = MemoryPayloadStore::new();
        let absent = ChunkHash::digest(b"never stored");
        let err = store.get(&absent).await.expect_err("must miss");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::ChunkNotFound(_))
        ));
    }
}

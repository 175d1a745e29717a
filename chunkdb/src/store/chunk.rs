//! Fixed-size content-addressed chunk storage.
//!
//! Every index node and every table descriptor serializes to a chunk of
//! exactly [`CHUNK_SIZE`] bytes whose address is the SHA-256 digest of its
//! content. Two chunks with identical bytes collapse to one address, which
//! is what makes re-flushing an unchanged subtree free.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::ChunkDbError;

/// Chunks are exactly this many bytes.
pub const CHUNK_SIZE: usize = 4096;

/// A 32-byte content address: the SHA-256 digest of a chunk's bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    /// The all-zero hash, used as the "no root yet" sentinel.
    pub const ZERO: ChunkHash = ChunkHash([0; 32]);

    /// Digest `bytes` into a chunk address.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        ChunkHash(hasher.finalize().into())
    }

    /// Whether this is the empty sentinel.
    pub fn is_zero(&self) -> bool {
        *self == ChunkHash::ZERO
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Reconstruct a hash from its raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChunkHash(bytes)
    }

    /// Parse the 64-hex-character form used in registry files.
    pub fn from_hex(text: &str) -> Result<Self> {
        let raw = hex::decode(text.trim())?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("root hash must be 32 bytes, got {}", raw.len()))?;
        Ok(ChunkHash(bytes))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", hex::encode(&self.0[..8]))
    }
}

/// Fixed-size content-addressed blob store.
///
/// `store` is idempotent: storing equal bytes returns the same address and
/// leaves a single chunk behind. Implementations must be safe under
/// concurrent calls; every index of a database shares one store.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Durably store a chunk of exactly [`CHUNK_SIZE`] bytes and return its
    /// content address.
    async fn store(&self, bytes: &[u8]) -> Result<ChunkHash>;

    /// Retrieve the chunk stored under `hash`.
    ///
    /// Fails with [`ChunkDbError::ChunkNotFound`] when absent, and with
    /// [`ChunkDbError::CorruptChunk`] when the bytes on hand no longer
    /// digest to `hash`.
    async fn retrieve(&self, hash: &ChunkHash) -> Result<Vec<u8>>;
}

/// Fetch a chunk that the tree structure says must exist.
///
/// Absence of a referenced chunk is corruption, not a missing key.
pub(crate) async fn retrieve_expected(store: &dyn ChunkStore, hash: &ChunkHash) -> Result<Vec<u8>> {
    match store.retrieve(hash).await {
        Ok(bytes) => Ok(bytes),
        Err(err) => match err.downcast_ref::<ChunkDbError>() {
            Some(ChunkDbError::ChunkNotFound(hash)) => Err(ChunkDbError::CorruptChunk(
                *hash,
                "referenced chunk missing from store".to_string(),
            )
            .into()),
            _ => Err(err),
        },
    }
}

/// One file per chunk under a directory, named by the hex form of the hash.
#[derive(Debug)]
pub struct DirectoryChunkStore {
    dir: PathBuf,
}

impl DirectoryChunkStore {
    /// Open a chunk directory, creating it if needed.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        self.dir.join(hash.to_string())
    }
}

#[async_trait]
impl ChunkStore for DirectoryChunkStore {
    async fn store(&self, bytes: &[u8]) -> Result<ChunkHash> {
        if bytes.len() != CHUNK_SIZE {
            return Err(ChunkDbError::ChunkLength(bytes.len()).into());
        }
        let hash = ChunkHash::digest(bytes);
        let path = self.chunk_path(&hash);
        // Equal bytes land at an equal path, so a re-store is a no-op.
        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(hash)
    }

    async fn retrieve(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        let bytes = match tokio::fs::read(self.chunk_path(hash)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ChunkDbError::ChunkNotFound(*hash).into());
            }
            Err(err) => return Err(err.into()),
        };
        if ChunkHash::digest(&bytes) != *hash {
            return Err(ChunkDbError::CorruptChunk(
                *hash,
                "stored bytes do not digest to the requested address".to_string(),
            )
            .into());
        }
        Ok(bytes)
    }
}

/// In-memory chunk store for tests and benchmarks.
///
/// Tracks how many retrievals were made so tests can assert that lazy
/// loading touches the store a bounded number of times.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<ChunkHash, Vec<u8>>>,
    reads: AtomicUsize,
}

impl MemoryChunkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct chunks held.
    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    /// Whether nothing has been stored yet.
    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }

    /// Number of `retrieve` calls made so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn store(&self, bytes: &[u8]) -> Result<ChunkHash> {
        if bytes.len() != CHUNK_SIZE {
            return Err(ChunkDbError::ChunkLength(bytes.len()).into());
        }
        let hash = ChunkHash::digest(bytes);
        self.chunks
            .write()
            .await
            .entry(hash)
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    async fn retrieve(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.chunks.read().await.get(hash) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(ChunkDbError::ChunkNotFound(*hash).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with(seed: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; CHUNK_SIZE];
        bytes[0] = seed;
        bytes[CHUNK_SIZE - 1] = seed;
        bytes
    }

    #[tokio::test]
    async fn it_round_trips_memory_chunks() {
        let store = MemoryChunkStore::new();
        let bytes = chunk_with(7);
        let hash = store.store(&bytes).await.expect("stores");
        assert_eq!(bytes, store.retrieve(&hash).await.expect("retrieves"));
    }

    #[tokio::test]
    async fn it_deduplicates_equal_chunks() {
        let store = MemoryChunkStore::new();
        let first = store.store(&chunk_with(7)).await.expect("stores");
        let second = store.store(&chunk_with(7)).await.expect("stores again");
        assert_eq!(first, second);
        assert_eq!(1, store.len().await);
        let other = store.store(&chunk_with(8)).await.expect("stores");
        assert_ne!(first, other);
        assert_eq!(2, store.len().await);
    }

    #[tokio::test]
    async fn it_rejects_wrong_lengths() {
        let store = MemoryChunkStore::new();
        let err = store.store(&[0u8; 100]).await.expect_err("must reject");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::ChunkLength(100))
        ));
    }

    #[tokio::test]
    async fn it_reports_missing_chunks() {
        let store = MemoryChunkStore::new();
        let absent = ChunkHash::digest(b"nothing stored here");
        let err = store.retrieve(&absent).await.expect_err("must miss");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::ChunkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn it_round_trips_directory_chunks() {
        let store = DirectoryChunkStore::open("chunk_roundtrip.db")
            .await
            .expect("opens store");
        let bytes = chunk_with(3);
        let hash = store.store(&bytes).await.expect("stores");
        assert_eq!(bytes, store.retrieve(&hash).await.expect("retrieves"));
        // A second store of the same bytes is a no-op.
        assert_eq!(hash, store.store(&bytes).await.expect("stores again"));
        std::fs::remove_dir_all("chunk_roundtrip.db").expect("cleanup");
    }

    #[tokio::test]
    async fn it_detects_corrupt_chunks() {
        let store = DirectoryChunkStore::open("chunk_corrupt.db")
            .await
            .expect("opens store");
        let hash = store.store(&chunk_with(9)).await.expect("stores");
        // Tamper with the file behind the store's back.
        std::fs::write(store.chunk_path(&hash), chunk_with(10)).expect("tampers");
        let err = store.retrieve(&hash).await.expect_err("must detect");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::CorruptChunk(_, _))
        ));
        std::fs::remove_dir_all("chunk_corrupt.db").expect("cleanup");
    }

    #[tokio::test]
    async fn it_escalates_missing_referenced_chunks() {
        let store = MemoryChunkStore::new();
        let absent = ChunkHash::digest(b"dangling reference");
        let err = retrieve_expected(&store, &absent)
            .await
            .expect_err("must escalate");
        assert!(matches!(
            err.downcast_ref::<ChunkDbError>(),
            Some(ChunkDbError::CorruptChunk(_, _))
        ));
    }
}

//! The root-hash registry: the only mutable anchor in the chunk graph.
//!
//! One file per table name under a registry directory, holding the
//! 64-hex-character root hash on a single line. Updates go through a
//! temporary file and a rename, so a reader sees either the old root or the
//! new one, never a torn write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::io::AsyncWriteExt;

use super::chunk::ChunkHash;
use crate::error::ChunkDbError;

/// Durable mapping from table name to current descriptor root hash.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    /// Open a registry directory, creating it if needed.
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Current root hash for `name`.
    ///
    /// Fails with [`ChunkDbError::RootNotFound`] before the first
    /// [`put_root`](Registry::put_root) for the name.
    pub async fn get_root(&self, name: &str) -> Result<ChunkHash> {
        match tokio::fs::read_to_string(self.entry_path(name)).await {
            Ok(text) => ChunkHash::from_hex(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ChunkDbError::RootNotFound(name.to_string()).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the root hash recorded for `name`.
    pub async fn put_root(&self, name: &str, hash: &ChunkHash) -> Result<()> {
        let staged = self.dir.join(format!("{name}.next"));
        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(format!("{hash}\n").as_bytes()).await?;
        file.sync_all().await?;
        tokio::fs::rename(&staged, self.entry_path(name)).await?;
        tracing::debug!(table = name, root = %hash, "registry updated");
        Ok(())
    }
}

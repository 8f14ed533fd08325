//! On-disk chunk blobs keyed by their own SHA-256
//!
//! Every read re-hashes the bytes and compares them to the key, so a blob
//! damaged on disk is reported as corruption instead of being served.

use crate::{DhtError, Result};
use chunkdht_core::chunk::{is_hex_key, sha256_hex};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Self-verifying chunk storage in a single directory
#[derive(Debug, Clone)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    /// Open (creating if needed) a chunk directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    fn check_key(hash: &str) -> Result<()> {
        if !is_hex_key(hash) {
            return Err(DhtError::InvalidRequest(format!("invalid chunk hash '{}'", hash)));
        }
        Ok(())
    }

    /// Store `data` under its content hash and return the hash
    pub async fn put(&self, data: &[u8]) -> Result<String> {
        let hash = sha256_hex(data);
        self.write_blob(&hash, data).await?;
        Ok(hash)
    }

    /// Store `data` under `hash`, refusing bytes that hash to something else
    pub async fn put_verified(&self, hash: &str, data: &[u8]) -> Result<()> {
        Self::check_key(hash)?;
        let actual = sha256_hex(data);
        if !actual.eq_ignore_ascii_case(hash) {
            return Err(DhtError::InvalidRequest(format!(
                "chunk bytes hash to {}, not {}",
                actual, hash
            )));
        }
        self.write_blob(&actual, data).await
    }

    async fn write_blob(&self, hash: &str, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!(".{}.tmp", hash));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.blob_path(hash)).await?;
        tracing::debug!("Stored chunk {} ({} bytes)", &hash[..8.min(hash.len())], data.len());
        Ok(())
    }

    /// Read a blob and verify it still hashes to `hash`
    pub async fn get_verified(&self, hash: &str) -> Result<Vec<u8>> {
        Self::check_key(hash)?;

        let data = match tokio::fs::read(self.blob_path(hash)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DhtError::NotFound(format!("chunk {}", hash)));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = sha256_hex(&data);
        if actual != hash {
            tracing::warn!("Stored chunk {} is corrupted (hashes to {})", hash, actual);
            return Err(DhtError::DataCorruption {
                key: hash.to_string(),
                actual,
            });
        }

        Ok(data)
    }

    pub async fn contains(&self, hash: &str) -> bool {
        is_hex_key(hash) && tokio::fs::try_exists(self.blob_path(hash)).await.unwrap_or(false)
    }

    /// Hashes of every stored blob
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_hex_key(&name) {
                hashes.push(name.into_owned());
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}

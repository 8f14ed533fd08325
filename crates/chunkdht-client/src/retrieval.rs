//! Retrieval engine
//!
//! Given a manifest and a few bootstrap contacts, resolves every chunk's
//! holders through the DHT, fetches and verifies the bytes, and writes the
//! reassembled file in manifest order.

use bytes::Bytes;
use chunkdht_core::chunk::{sha256_hex, verify_chunk};
use chunkdht_core::{Manifest, PeerRecord};
use chunkdht_dht::lookup;
use chunkdht_dht::{BootstrapPeer, Contact, PeerRpc, DEFAULT_ALPHA};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default number of chunks resolved at once
pub const DEFAULT_CONCURRENCY: usize = 6;

#[derive(Error, Debug)]
pub enum RetrieveError {
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// The DHT had no usable peer record for the chunk
    #[error("No peers found for chunk {index} ({hash})")]
    NoPeersFound { index: usize, hash: String },

    /// Every listed peer was unreachable or served bytes with the wrong hash
    #[error("All {attempts} peers failed for chunk {index} ({hash})")]
    AllPeersFailed {
        index: usize,
        hash: String,
        attempts: usize,
    },

    #[error("Reassembled {actual} bytes but the manifest declares {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, RetrieveError>;

/// Progress callback: `(completed, total)` chunk counts
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Retrieval tuning
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    /// Maximum chunk resolutions (lookup + fetch) in flight
    pub concurrency: usize,
    /// Lookup fan-out per round
    pub alpha: usize,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            alpha: DEFAULT_ALPHA,
        }
    }
}

/// Completed-chunk counter shared by the fetch tasks
struct Progress {
    completed: Mutex<usize>,
    total: usize,
    callback: Option<ProgressFn>,
}

impl Progress {
    async fn advance(&self) {
        let mut completed = self.completed.lock().await;
        *completed += 1;
        debug!("Retrieved {}/{} chunks", *completed, self.total);
        // Reported while the lock is held so callers see a strictly increasing count
        if let Some(callback) = &self.callback {
            callback(*completed, self.total);
        }
    }
}

/// Fetches manifests' chunks over a [`PeerRpc`]
pub struct Retriever<R: ?Sized> {
    rpc: Arc<R>,
    options: RetrieveOptions,
    progress: Option<ProgressFn>,
}

impl<R: PeerRpc + ?Sized + 'static> Retriever<R> {
    pub fn new(rpc: Arc<R>) -> Self {
        Self {
            rpc,
            options: RetrieveOptions::default(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: RetrieveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn options(&self) -> &RetrieveOptions {
        &self.options
    }

    /// Resolve seed entries (pinging those without an id), then retrieve
    pub async fn retrieve_with_bootstrap(
        &self,
        manifest: &Manifest,
        bootstrap: &[BootstrapPeer],
        output_dir: &Path,
    ) -> Result<PathBuf> {
        let contacts = lookup::resolve_bootstrap(self.rpc.as_ref(), bootstrap, None).await;
        if contacts.is_empty() {
            warn!("None of the {} bootstrap peers could be reached", bootstrap.len());
        }
        self.retrieve_file(manifest, &contacts, output_dir).await
    }

    /// Retrieve the file described by `manifest` into `output_dir`.
    ///
    /// Every chunk is looked up starting from `bootstrap`, fetched from the
    /// peers its DHT record lists (in order, falling back on transport
    /// failure or hash mismatch) and kept in memory until all chunks are in.
    /// The first chunk that cannot be obtained aborts the outstanding tasks
    /// and fails the whole retrieval; no file named `fileId` is written then.
    pub async fn retrieve_file(
        &self,
        manifest: &Manifest,
        bootstrap: &[Contact],
        output_dir: &Path,
    ) -> Result<PathBuf> {
        manifest
            .validate()
            .map_err(|e| RetrieveError::InvalidManifest(e.to_string()))?;

        let total = manifest.chunk_hashes.len();
        info!(
            "Retrieving {} ({} chunks, concurrency {})",
            manifest.file_id, total, self.options.concurrency
        );

        let limiter = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let start: Arc<[Contact]> = Arc::from(bootstrap);
        let progress = Arc::new(Progress {
            completed: Mutex::new(0),
            total,
            callback: self.progress.clone(),
        });
        let alpha = self.options.alpha.max(1);

        let mut tasks = JoinSet::new();
        for (index, hash) in manifest.chunk_hashes.iter().cloned().enumerate() {
            let rpc = Arc::clone(&self.rpc);
            let limiter = Arc::clone(&limiter);
            let start = Arc::clone(&start);
            let progress = Arc::clone(&progress);

            tasks.spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|e| RetrieveError::Task(e.to_string()))?;
                let data = fetch_chunk(rpc.as_ref(), &start, index, &hash, alpha).await?;
                progress.advance().await;
                Ok::<_, RetrieveError>((index, data))
            });
        }

        // Returning early drops the JoinSet, which aborts the remaining tasks
        let mut slots: Vec<Option<Bytes>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            let (index, data) = joined.map_err(|e| RetrieveError::Task(e.to_string()))??;
            slots[index] = Some(data);
        }

        let chunks = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| RetrieveError::Task(format!("chunk {} never completed", index)))
            })
            .collect::<Result<Vec<_>>>()?;

        let actual: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        if let Some(expected) = manifest.size {
            if expected != actual {
                return Err(RetrieveError::SizeMismatch { expected, actual });
            }
        }

        let path = write_output(output_dir, &manifest.file_id, &chunks).await?;
        info!("Retrieved {} ({} bytes) to {}", manifest.file_id, actual, path.display());
        Ok(path)
    }
}

/// Resolve one chunk's holders and fetch verified bytes from the first that serves them
async fn fetch_chunk<R: PeerRpc + ?Sized>(
    rpc: &R,
    start: &[Contact],
    index: usize,
    hash: &str,
    alpha: usize,
) -> Result<Bytes> {
    let record = lookup::find_value(rpc, start, hash, alpha)
        .await
        .and_then(|value| PeerRecord::from_value(&value))
        .ok_or_else(|| RetrieveError::NoPeersFound {
            index,
            hash: hash.to_string(),
        })?;

    for peer in &record.peers {
        match rpc.get_chunk(peer, hash).await {
            Ok(data) if verify_chunk(&data, hash) => {
                debug!("Chunk {} fetched from {} ({} bytes)", index, peer, data.len());
                return Ok(data);
            }
            Ok(data) => warn!(
                "Chunk {} from {} failed verification: expected {}, got {}",
                index,
                peer,
                hash,
                sha256_hex(&data)
            ),
            Err(e) => debug!("Chunk {} unavailable from {}: {}", index, peer, e),
        }
    }

    Err(RetrieveError::AllPeersFailed {
        index,
        hash: hash.to_string(),
        attempts: record.peers.len(),
    })
}

/// Write the chunks to a hidden sibling, then rename it to `file_id`
async fn write_output(output_dir: &Path, file_id: &str, chunks: &[Bytes]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir).await?;
    let path = output_dir.join(file_id);
    let part = output_dir.join(format!(".{}.part", file_id));

    let written = async {
        let mut file = tokio::fs::File::create(&part).await?;
        for chunk in chunks {
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, &path).await
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkdht_core::PeerAddr;
    use chunkdht_dht::rpc::mock::MemoryNetwork;
    use chunkdht_dht::{DhtConfig, DhtNode};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// A DHT node that also serves chunks, registered on `net`
    async fn node(net: &MemoryNetwork, dir: &TempDir, i: u16) -> DhtNode {
        let node = DhtNode::open(
            DhtConfig::with_seed(&format!("retrieval-{}", i)),
            PeerAddr::new("10.1.0.1", 8000 + i),
            dir.path().join(format!("node-{}", i)),
        )
        .await
        .unwrap();
        net.register(&node);
        node
    }

    fn manifest(name: &str, chunks: &[&[u8]]) -> Manifest {
        Manifest {
            file_id: name.to_string(),
            total_chunks: chunks.len() as u32,
            chunk_hashes: chunks.iter().map(|c| sha256_hex(c)).collect(),
            chunk_size: 4,
            size: Some(chunks.iter().map(|c| c.len() as u64).sum()),
        }
    }

    fn record(peers: &[&DhtNode]) -> serde_json::Value {
        PeerRecord::new(peers.iter().map(|n| n.addr().clone()).collect()).to_value()
    }

    #[tokio::test]
    async fn test_retrieves_with_dead_peer_fallback() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 0).await;
        let dead = node(&net, &dir, 1).await;
        let live = node(&net, &dir, 2).await;
        net.set_dead(dead.addr(), true);

        let chunks: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];
        let m = manifest("three.bin", &chunks);
        for chunk in chunks {
            live.chunk_store().put(chunk).await.unwrap();
        }
        dht.handle_store(m.chunk_hashes[0].clone(), record(&[&live])).await.unwrap();
        dht.handle_store(m.chunk_hashes[1].clone(), record(&[&dead, &live])).await.unwrap();
        dht.handle_store(m.chunk_hashes[2].clone(), record(&[&live])).await.unwrap();

        let out = TempDir::new().unwrap();
        let path = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap();

        assert_eq!(path, out.path().join("three.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), b"aaaabbbbcc");
        assert!(!out.path().join(".three.bin.part").exists());
    }

    #[tokio::test]
    async fn test_lying_peer_falls_back_to_honest_one() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 10).await;
        let liar = node(&net, &dir, 11).await;
        let honest = node(&net, &dir, 12).await;
        net.set_lying(liar.addr(), &b"forged"[..]);

        let m = manifest("one.bin", &[b"truth"]);
        honest.chunk_store().put(b"truth").await.unwrap();
        dht.handle_store(m.chunk_hashes[0].clone(), record(&[&liar, &honest]))
            .await
            .unwrap();

        let out = TempDir::new().unwrap();
        let path = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"truth");
        assert_eq!(net.calls_to("get_chunk").len(), 2);
    }

    #[tokio::test]
    async fn test_all_peers_lying_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 20).await;
        let liar = node(&net, &dir, 21).await;
        net.set_lying(liar.addr(), &b"forged"[..]);

        let m = manifest("bad.bin", &[b"real bytes"]);
        dht.handle_store(m.chunk_hashes[0].clone(), record(&[&liar]))
            .await
            .unwrap();

        let out = TempDir::new().unwrap();
        let err = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap_err();

        match err {
            RetrieveError::AllPeersFailed { index, attempts, .. } => {
                assert_eq!(index, 0);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected AllPeersFailed, got {:?}", other),
        }
        assert!(!out.path().join("bad.bin").exists());
        assert!(!out.path().join(".bad.bin.part").exists());
    }

    #[tokio::test]
    async fn test_missing_record_is_no_peers_found() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 30).await;
        let holder = node(&net, &dir, 31).await;

        let m = manifest("gap.bin", &[b"one!", b"two!"]);
        holder.chunk_store().put(b"one!").await.unwrap();
        dht.handle_store(m.chunk_hashes[0].clone(), record(&[&holder]))
            .await
            .unwrap();

        let out = TempDir::new().unwrap();
        let err = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap_err();
        match err {
            RetrieveError::NoPeersFound { index, hash } => {
                assert_eq!(index, 1);
                assert_eq!(hash, m.chunk_hashes[1]);
            }
            other => panic!("expected NoPeersFound, got {:?}", other),
        }
        assert!(!out.path().join("gap.bin").exists());
    }

    #[tokio::test]
    async fn test_malformed_record_is_no_peers_found() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 40).await;

        let m = manifest("odd.bin", &[b"data"]);
        dht.handle_store(m.chunk_hashes[0].clone(), json!({"peers": []}))
            .await
            .unwrap();

        let out = TempDir::new().unwrap();
        let err = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrieveError::NoPeersFound { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_malformed_entry_is_skipped() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 45).await;
        let holder = node(&net, &dir, 46).await;

        let m = manifest("mixed.bin", &[b"mixed record"]);
        holder.chunk_store().put(b"mixed record").await.unwrap();
        let value = json!({"peers": [
            {"host": "x"},
            {"host": holder.addr().host, "port": holder.addr().port}
        ]});
        dht.handle_store(m.chunk_hashes[0].clone(), value).await.unwrap();

        let out = TempDir::new().unwrap();
        let path = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"mixed record");
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 50).await;
        let holder = node(&net, &dir, 51).await;

        let chunks: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 16]).collect();
        let refs: Vec<&[u8]> = chunks.iter().map(|c| c.as_slice()).collect();
        let m = manifest("progress.bin", &refs);
        for chunk in &chunks {
            holder.chunk_store().put(chunk).await.unwrap();
        }
        for hash in &m.chunk_hashes {
            dht.handle_store(hash.clone(), record(&[&holder])).await.unwrap();
        }

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let out = TempDir::new().unwrap();
        Retriever::new(net.clone())
            .with_options(RetrieveOptions {
                concurrency: 4,
                alpha: 3,
            })
            .with_progress(move |done, total| sink.lock().unwrap().push((done, total)))
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, (1..=8).map(|i| (i, 8)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_manifest_writes_empty_file() {
        let net = Arc::new(MemoryNetwork::new());
        let m = Manifest {
            file_id: "empty.bin".to_string(),
            total_chunks: 0,
            chunk_hashes: vec![],
            chunk_size: 1024,
            size: Some(0),
        };

        let out = TempDir::new().unwrap();
        let path = Retriever::new(net)
            .retrieve_file(&m, &[], out.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_size_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 60).await;
        let holder = node(&net, &dir, 61).await;

        let mut m = manifest("short.bin", &[b"12345"]);
        m.size = Some(9);
        holder.chunk_store().put(b"12345").await.unwrap();
        dht.handle_store(m.chunk_hashes[0].clone(), record(&[&holder]))
            .await
            .unwrap();

        let out = TempDir::new().unwrap();
        let err = Retriever::new(net.clone())
            .retrieve_file(&m, &[dht.contact()], out.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RetrieveError::SizeMismatch {
                expected: 9,
                actual: 5
            }
        ));
        assert!(!out.path().join("short.bin").exists());
    }

    #[tokio::test]
    async fn test_invalid_manifest_sends_nothing() {
        let net = Arc::new(MemoryNetwork::new());
        let m = Manifest {
            file_id: "x.bin".to_string(),
            total_chunks: 2,
            chunk_hashes: vec![sha256_hex(b"only one")],
            chunk_size: 8,
            size: None,
        };

        let out = TempDir::new().unwrap();
        let err = Retriever::new(net.clone())
            .retrieve_file(&m, &[], out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, RetrieveError::InvalidManifest(_)));
        assert!(net.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_with_idless_bootstrap() {
        let dir = TempDir::new().unwrap();
        let net = Arc::new(MemoryNetwork::new());
        let dht = node(&net, &dir, 70).await;
        let holder = node(&net, &dir, 71).await;

        let m = manifest("boot.bin", &[b"seeded"]);
        holder.chunk_store().put(b"seeded").await.unwrap();
        dht.handle_store(m.chunk_hashes[0].clone(), record(&[&holder]))
            .await
            .unwrap();

        let out = TempDir::new().unwrap();
        let path = Retriever::new(net.clone())
            .retrieve_with_bootstrap(&m, &[BootstrapPeer::from(dht.addr().clone())], out.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"seeded");
        assert_eq!(net.calls_to("ping").len(), 1);
    }
}

//! Publisher
//!
//! Upload-side counterpart of the retrieval engine: splits a file into
//! chunks, places each chunk on a storage peer and announces the placement
//! in the DHT under the chunk's hash.

use bytes::Bytes;
use chunkdht_core::chunk::chunk_file;
use chunkdht_core::{Manifest, PeerAddr, PeerRecord, DEFAULT_CHUNK_SIZE};
use chunkdht_dht::{lookup, Contact, DhtError, PeerRpc, DEFAULT_ALPHA, DEFAULT_K};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("No storage peers given")]
    NoStoragePeers,

    #[error(transparent)]
    Core(#[from] chunkdht_core::Error),

    #[error("Upload of chunk {index} to {peer} failed: {source}")]
    Upload {
        index: usize,
        peer: PeerAddr,
        #[source]
        source: DhtError,
    },

    /// No DHT node acknowledged the peer record for this chunk
    #[error("Chunk {index} ({hash}) could not be announced")]
    NotAnnounced { index: usize, hash: String },
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
    pub chunk_size: usize,
    pub alpha: usize,
    /// Contacts sought when locating the nodes closest to a chunk hash
    pub k: usize,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            alpha: DEFAULT_ALPHA,
            k: DEFAULT_K,
        }
    }
}

/// Chunk `path`, upload chunk `i` to `storage_peers[i % n]`, and announce
/// `{peers: [that peer]}` under the chunk's hash.
///
/// Returns the manifest describing the published file.
pub async fn publish_file<R: PeerRpc + ?Sized>(
    rpc: &R,
    path: &Path,
    storage_peers: &[PeerAddr],
    dht_contacts: &[Contact],
    options: &PublishOptions,
) -> Result<Manifest, PublishError> {
    if storage_peers.is_empty() {
        return Err(PublishError::NoStoragePeers);
    }

    let (manifest, chunks) = chunk_file(path, options.chunk_size)?;
    info!(
        "Publishing {} ({} chunks) to {} storage peers",
        manifest.file_id,
        manifest.total_chunks,
        storage_peers.len()
    );

    for (index, (hash, data)) in manifest.chunk_hashes.iter().zip(chunks).enumerate() {
        let peer = &storage_peers[index % storage_peers.len()];
        rpc.put_chunk(peer, hash, Bytes::from(data))
            .await
            .map_err(|source| PublishError::Upload {
                index,
                peer: peer.clone(),
                source,
            })?;

        let record = PeerRecord::new(vec![peer.clone()]).to_value();
        let acked = lookup::announce_value(
            rpc,
            dht_contacts,
            hash,
            &record,
            options.alpha,
            options.k,
        )
        .await;
        if acked == 0 {
            return Err(PublishError::NotAnnounced {
                index,
                hash: hash.clone(),
            });
        }
        debug!("Chunk {} stored on {}, announced to {} nodes", index, peer, acked);
    }

    info!("Published {}", manifest.file_id);
    Ok(manifest)
}

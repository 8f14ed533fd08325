//! Content hashing and file chunking

use crate::{error::Result, types::Manifest, Error, HASH_HEX_LEN};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 digest of `data` as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a chunk against its expected content hash
pub fn verify_chunk(data: &[u8], expected_hash: &str) -> bool {
    sha256_hex(data).eq_ignore_ascii_case(expected_hash)
}

/// True if `s` is non-empty, even-length hex
pub fn is_hex_key(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True if `s` has the shape of a SHA-256 hex digest
pub fn is_content_hash(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && is_hex_key(s)
}

/// Split a file into fixed-size chunks and describe them with a manifest.
///
/// The manifest's `fileId` is the file name and `size` its byte length.
pub fn chunk_file(path: &Path, chunk_size: usize) -> Result<(Manifest, Vec<Vec<u8>>)> {
    if chunk_size == 0 {
        return Err(Error::InvalidData("chunk size must be positive".to_string()));
    }

    let file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();
    let file_id = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut reader = std::io::BufReader::new(file);
    let mut chunks = Vec::new();
    let mut hashes = Vec::new();

    loop {
        let mut buffer = Vec::with_capacity(chunk_size);
        let bytes_read = (&mut reader)
            .take(chunk_size as u64)
            .read_to_end(&mut buffer)?;

        if bytes_read == 0 {
            break;
        }

        hashes.push(sha256_hex(&buffer));
        chunks.push(buffer);

        if bytes_read < chunk_size {
            break;
        }
    }

    let manifest = Manifest {
        file_id,
        total_chunks: chunks.len() as u32,
        chunk_hashes: hashes,
        chunk_size: chunk_size as u32,
        size: Some(file_size),
    };

    Ok((manifest, chunks))
}

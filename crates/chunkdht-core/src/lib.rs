//! chunkdht core - shared types, content hashing, and chunking
//!
//! This crate provides the data shapes every other chunkdht crate agrees on:
//! file manifests, peer addresses, the DHT record value that lists which peers
//! hold a chunk, and SHA-256 content addressing.

pub mod chunk;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

//! chunkdht Client Library
//!
//! Retrieval of chunked files located through the DHT, the upload-side
//! publisher, and client configuration.

pub mod config;
pub mod publisher;
pub mod retrieval;

pub use publisher::{publish_file, PublishError, PublishOptions};
pub use retrieval::{RetrieveError, RetrieveOptions, Retriever};

//! Object storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where the shards
//! physically live.  [`gcp::GcsBackend`] talks to Google Cloud Storage;
//! [`memory::MemoryBackend`] keeps everything in process.

pub mod backend;
pub mod gcp;
pub mod memory;

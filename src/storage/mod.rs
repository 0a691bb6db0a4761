//! Pluggable storage for image payloads and their thumbnails.

pub mod backend;

pub use backend::{FsBackend, MemoryBackend, StorageBackend};

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Model registry types and the checksum-verified download manager for
//! Edge-Veda.
//!
//! The registry is a read-only data table; the manager streams downloads to
//! a temp file, verifies SHA-256 incrementally, and renames atomically so a
//! model path never holds a partial file.

/// Checksum-verified downloads with atomic installation.
pub mod manager;
/// Read-only model registry types.
pub mod registry;

pub use manager::{DownloadHandle, DownloadProgress, ModelError, ModelManager};
pub use registry::{ModelEntry, ModelKind, ModelRegistry};

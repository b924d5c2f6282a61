#![deny(missing_docs)]
#![deny(unreachable_pub)]

//! Minimal Rust wrapper around the Edge-Veda inference engine C API.
//!
//! All `unsafe` in the workspace lives here. The safe wrappers copy every
//! string in both directions and never retain a raw pointer beyond a single
//! call. The native library is linked only when `EDGE_VEDA_ENGINE_DIR`
//! points at a built engine (see `build.rs`); downstream crates reach these
//! bindings through the runtime's `native-engine` feature.

/// Public API for this crate.
pub mod api;

mod ffi;

pub use api::{
    CancelFlag, EngineHandle, EngineSysError, GenParams, available_bytes, code, rss_bytes, stop,
    version,
};

#![forbid(unsafe_code)]
//! sealfs public API facade.
//!
//! Re-exports the engine surface from `sealfs-core` through a stable
//! external interface; downstream consumers depend on this crate.

pub use sealfs_core::*;

#![forbid(unsafe_code)]
//! mapfs public API facade.
//!
//! Re-exports the core surface from `mapfs-core` through a stable
//! external interface. This is the crate downstream consumers (CLI,
//! harness, embedders) depend on.

pub use mapfs_core::*;

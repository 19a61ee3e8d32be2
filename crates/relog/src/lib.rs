#![forbid(unsafe_code)]
//! relog public API facade.
//!
//! Re-exports the engine from `relog-core` through a stable external
//! interface. This is the crate downstream consumers (the CLI, embedding
//! filesystems) depend on.

pub use relog_core::*;

//! Observability
//!
//! The per-run meta report consumed by calling pipelines.

pub mod meta;

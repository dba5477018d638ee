//! Keeper core.
//!
//! Owns the process model and lifecycle of one run: fork, poll, reap,
//! teardown and the final report.

pub mod supervisor;
pub mod types;

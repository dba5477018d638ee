//! minibox: a resource-limiting process keeper
//! Runs one untrusted program under rlimits and time limits, and reports the
//! outcome through a small line-oriented meta report.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Keeper signal front-end (flags, tick, fatal path)
//! - [`kernel::rlimit`]: Resource-limit plan applied in the child
//! - [`kernel::process`]: wait4/kill/reap of the child and its process group
//! - [`kernel::cpu_time`]: CPU time sources for the timeout poll
//!
//! ## Execution Control ([`exec`])
//! - [`exec::preexec`]: Type-state enforced pre-exec ordering
//! - [`exec::error_pipe`]: Startup-failure side channel
//!
//! ## Keeper ([`core`])
//! - [`core::supervisor`]: Fork, poll, reap and finalize
//! - [`core::types`]: Child handle, timing window, resource usage
//!
//! ## Outcome ([`verdict`])
//! - [`verdict::verdict`]: Outcome classification and status codes
//! - [`verdict::timeout`]: CPU and wall clock limit checks
//!
//! ## Observability ([`observability`])
//! - [`observability::meta`]: The per-run meta report
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Shared type definitions, constants and errors
//! - [`config::validator`]: Startup validation of the run configuration
//!
//! ## Utilities ([`utils`])
//! - [`utils::env_rules`]: Environment rule engine
//!
//! # Design Principles
//!
//! 1. **One immutable config** - Built once from the command line
//! 2. **Kernel as truth** - Final accounting comes from `wait4` rusage
//! 3. **Flag-only handlers** - The keeper loop does the work, not the signal handler
//! 4. **Types prevent errors** - The child's setup steps cannot be reordered
//! 5. **Minimal unsafe** - Thin wrappers with explicit SAFETY notes

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Keeper
pub mod core;

// Outcome
pub mod verdict;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the minibox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use crate::core::supervisor::run_sandbox;
pub use exec::preexec;
pub use verdict::verdict::Outcome;

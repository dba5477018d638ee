//! Utilities
//!
//! Environment rule resolution for the sandboxed program.

pub mod env_rules;

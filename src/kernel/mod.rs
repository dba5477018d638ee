//! Thin wrappers around Linux kernel primitives.
//!
//! Most `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: signal -> rlimit -> process -> cpu_time

pub mod cpu_time;
pub mod process;
pub mod rlimit;
pub mod signal;

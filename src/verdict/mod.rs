//! Outcome classification
//!
//! Derives the run's outcome as pure functions over the wait status and
//! resource accounting.

pub mod timeout;
pub mod verdict;

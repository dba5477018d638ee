//! Execution control
//!
//! Launch planning in the keeper and the type-state pre-exec chain of the child.

pub mod error_pipe;
pub mod preexec;

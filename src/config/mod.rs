//! Configuration
//!
//! Immutable run configuration and startup validation.

pub mod types;
pub mod validator;

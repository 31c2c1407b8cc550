//! Core shared library for the LogScope crates.
//!
//! Holds the pieces every other crate leans on: the canonical error type,
//! environment-driven configuration, tracing setup for the library's own
//! diagnostics, and JSON helpers with shared error semantics.

pub mod config;
pub mod errors;
pub mod logging;
pub mod serde_utils;

pub use config::{Environment, LogScopeConfig};
pub use errors::{ConfigError, LogScopeError, Result as CoreResult};

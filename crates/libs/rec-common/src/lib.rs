//! Shared plumbing for the Rootly edge connector: configuration loading and
//! tracing initialisation. Everything here is consumed by both the library
//! crates and the `rec` binary.

pub mod config;
pub mod error;
pub mod tracing;

pub use config::AppConfig;
pub use error::{Error, Result};

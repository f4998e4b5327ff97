//! Configuration
//!
//! Runtime options, the error taxonomy, well-known paths and config-file loading.

pub mod loader;
pub mod paths;
pub mod types;

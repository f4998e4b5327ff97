//! Thin wrappers around POSIX process primitives.
//!
//! All credential and signal `unsafe` code is concentrated here.

pub mod credentials;
pub mod signal;

//! Utilities
//!
//! Descriptor sealing, environment hygiene, and random channel names.

pub mod env_hygiene;
pub mod fd_closure;
pub mod random;

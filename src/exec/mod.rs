//! Engine process creation
//!
//! Fork, privilege drop, descriptor sealing, and exec of the engine with its
//! one inherited channel.

pub mod handoff;
pub mod launcher;
pub mod permissions;
pub mod preexec;

pub use launcher::{launch_engine, EngineHandle, LaunchRequest};

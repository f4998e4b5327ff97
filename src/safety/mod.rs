//! Safety
//!
//! Reversible ownership changes and single-instance PID file.

pub mod ownership;
pub mod pid_file;

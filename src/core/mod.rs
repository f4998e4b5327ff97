//! Daemon core.
//!
//! Runtime state, the control loop shared by every process role, the
//! management-host seam, and one-shot lifecycle requests.

pub mod auth;
pub mod control_loop;
pub mod host;
pub mod lifecycle;
pub mod state;

pub use control_loop::{DaemonControlLoop, LoopRole, RoleConfig, ServeExit, ShutdownReport};
pub use host::{LoggingHost, ManagementHost};
pub use state::ServerRuntimeState;

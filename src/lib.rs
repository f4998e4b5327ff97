//! cimd: privilege-separated bootstrap core for a CIM/WS-Management daemon
//!
//! A root server owns the PID file, the client-facing listeners and the
//! ownership grants; an unprivileged engine does the protocol work over one
//! inherited socket-pair channel.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Lifecycle signals recorded by async-safe handlers
//! - [`kernel::credentials`]: Verified uid/gid transition to the service account
//!
//! ## Engine Launch ([`exec`])
//! - [`exec::launcher`]: Fork/exec of the engine with a single inherited channel
//! - [`exec::preexec`]: Type-state enforced pre-exec ordering
//! - [`exec::handoff`]: Typed channel handoff across exec
//! - [`exec::permissions`]: Paths granted to the engine while still root
//!
//! ## Transport ([`transport`])
//! - [`transport::frame`]: Length-prefixed JSON frames
//! - [`transport::protocol`]: Protocol handles, secret handshake, socket-file bootstrap
//! - [`transport::mux`]: Multiplexer slots and readiness wait
//! - [`transport::socket_dir`]: Per-incarnation socket directory
//!
//! ## Control ([`core`])
//! - [`core::control_loop`]: Restartable control loop shared by all roles
//! - [`core::state`]: Per-process runtime state and engine reaping
//! - [`core::lifecycle`]: Stop/reload requests against a running instance
//! - [`core::host`]: Management protocol seam
//!
//! ## Safety ([`safety`])
//! - [`safety::ownership`]: Reversible ownership ledger
//! - [`safety::pid_file`]: Single-instance PID file
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//!
//! # Design Principles
//!
//! 1. **Drop privileges before untrusted code** - Verified before exec, never retried
//! 2. **One inherited descriptor** - Everything else is closed in the child
//! 3. **Handlers only record** - The main loop performs every transition
//! 4. **Transport is disposable** - Rebuilt from scratch on every restart

// Kernel Primitives
pub mod kernel;

// Engine Launch
pub mod exec;

// Transport
pub mod transport;

// Control loop and runtime state
pub mod core;

// Safety
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoints shared by cimserver/cimengine binaries.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;

//! Binary transport
//!
//! Framed messages, per-endpoint protocol handles, multiplexer slots, and the
//! sockets directory holding the server's engine-facing socket.

pub mod frame;
pub mod mux;
pub mod protocol;
pub mod socket_dir;

pub use mux::{listen_on_named_socket, listen_on_stream_endpoint, Multiplexer, MuxStatus};
pub use protocol::{BootstrapInfo, ProtocolHandle};

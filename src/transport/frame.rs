/// Wire format of the binary channel
///
/// Every message is a 4-byte big-endian length followed by that many bytes of
/// JSON. The decoder is incremental so it can sit behind non-blocking reads.
use crate::config::types::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 1 << 20;

const HEADER_LEN: usize = 4;

/// Bootstrap and application messages exchanged over one connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First message from a peer that must prove the shared secret
    Hello { secret: String },
    HelloAck,
    /// Sent right before the connection is closed
    Reject { reason: String },
    /// Engine asks where its client-facing socket lives
    SocketFileRequest,
    SocketFileResponse {
        /// Client-facing named socket the engine must bind
        socket_file: PathBuf,
        /// Server's engine socket, guarded by the shared secret
        server_socket: PathBuf,
    },
    /// Opaque payload for the management protocol layer
    Data { payload: Vec<u8> },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::HelloAck => "hello_ack",
            Message::Reject { .. } => "reject",
            Message::SocketFileRequest => "socket_file_request",
            Message::SocketFileResponse { .. } => "socket_file_response",
            Message::Data { .. } => "data",
        }
    }
}

// Never print the secret carried by Hello.
impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Reject { reason } => write!(f, "Reject({})", reason),
            Message::SocketFileResponse {
                socket_file,
                server_socket,
            } => write!(
                f,
                "SocketFileResponse({}, {})",
                socket_file.display(),
                server_socket.display()
            ),
            Message::Data { payload } => write!(f, "Data({} bytes)", payload.len()),
            other => f.write_str(other.kind()),
        }
    }
}

/// Length-prefixed encoding of `message`
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| DaemonError::Protocol(format!("encode {}: {}", message.kind(), e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(DaemonError::Protocol(format!(
            "frame of {} bytes exceeds limit {}",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reassembles frames from arbitrarily split reads
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete message, or None until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(DaemonError::Protocol(format!(
                "peer announced {} byte frame (limit {})",
                len, MAX_FRAME_LEN
            )));
        }

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let message = serde_json::from_slice(&self.buf[HEADER_LEN..HEADER_LEN + len])
            .map_err(|e| DaemonError::Protocol(format!("malformed frame: {}", e)))?;
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(message))
    }
}

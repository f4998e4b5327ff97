/// Binary protocol handle: one transport endpoint plus its live connections
///
/// A handle is bound either to a named socket file (accepting any number of
/// peers) or to one already-connected stream endpoint. When a secret is
/// configured, a peer must send a matching Hello before anything else is
/// processed; anything else gets a Reject and the connection is dropped.
use crate::config::types::{DaemonError, Result};
use crate::observability::audit;
use crate::transport::frame::{encode, FrameDecoder, Message, MAX_FRAME_LEN};
use crate::utils::random::SecretToken;
use log::{debug, info, warn};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Upper bound for a single blocked write
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Answer to a socket-file request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapInfo {
    pub socket_file: PathBuf,
    pub server_socket: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    NamedSocket,
    Stream,
}

/// What a readiness event refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollTarget {
    Listener,
    Connection(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    AwaitingHello,
    Ready,
}

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Continue,
    Close,
    Rejected(String),
}

/// Wait until `fd` is ready for `events`. EINTR counts as not ready.
pub(crate) fn wait_for(fd: RawFd, events: libc::c_short, timeout: Duration) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd for the duration of the call.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(DaemonError::Transport(format!("poll failed: {}", err)));
    }
    Ok(rc > 0)
}

/// One peer connection
pub struct Connection {
    stream: UnixStream,
    decoder: FrameDecoder,
    state: SessionState,
    bootstrap_answered: bool,
}

impl Connection {
    pub fn new(stream: UnixStream, requires_secret: bool) -> Result<Self> {
        stream.set_nonblocking(true).map_err(|e| {
            DaemonError::Transport(format!("cannot set non-blocking mode: {}", e))
        })?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            state: if requires_secret {
                SessionState::AwaitingHello
            } else {
                SessionState::Ready
            },
            bootstrap_answered: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        let frame = encode(message)?;
        let deadline = Instant::now() + SEND_TIMEOUT;
        let mut written = 0;

        while written < frame.len() {
            match self.stream.write(&frame[written..]) {
                Ok(0) => return Err(DaemonError::Transport("peer closed during send".into())),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(DaemonError::Transport(format!(
                            "timed out sending {}",
                            message.kind()
                        )));
                    }
                    wait_for(self.fd(), libc::POLLOUT, remaining)?;
                }
                Err(e) => {
                    return Err(DaemonError::Transport(format!(
                        "send {} failed: {}",
                        message.kind(),
                        e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Read everything currently available. Ok(false) once the peer has closed.
    pub fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 8192];
        loop {
            if self.decoder.pending() > 2 * MAX_FRAME_LEN {
                return Ok(true);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(false),
                Err(e) => return Err(DaemonError::Transport(format!("read failed: {}", e))),
            }
        }
    }

    pub fn next_message(&mut self) -> Result<Option<Message>> {
        self.decoder.next_message()
    }

    /// Block until one message arrives or `timeout` passes.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.next_message()? {
                return Ok(message);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DaemonError::Transport("timed out waiting for peer".into()));
            }
            if !wait_for(self.fd(), libc::POLLIN, remaining)? {
                continue;
            }
            if !self.fill()? {
                return match self.next_message()? {
                    Some(message) => Ok(message),
                    None => Err(DaemonError::Transport("peer closed the channel".into())),
                };
            }
        }
    }

    fn reject(&mut self, reason: &str) -> Disposition {
        // Best effort; the connection is dropped either way.
        let _ = self.send(&Message::Reject {
            reason: reason.to_string(),
        });
        Disposition::Rejected(reason.to_string())
    }

    /// Apply the handshake and bootstrap rules to one inbound message.
    fn handle_inbound(
        &mut self,
        message: Message,
        secret: Option<&SecretToken>,
        bootstrap: Option<&BootstrapInfo>,
        on_payload: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>,
    ) -> Result<Disposition> {
        if self.state == SessionState::AwaitingHello {
            return match message {
                Message::Hello { secret: presented } => self.authenticate(&presented, secret),
                _ => Ok(self.reject("authentication required")),
            };
        }

        match message {
            Message::Hello { secret: presented } => self.authenticate(&presented, secret),
            Message::SocketFileRequest => {
                let info = match bootstrap {
                    Some(info) => info,
                    None => return Ok(self.reject("no socket file on this endpoint")),
                };
                if self.bootstrap_answered {
                    return Ok(self.reject("bootstrap already completed"));
                }
                self.send(&Message::SocketFileResponse {
                    socket_file: info.socket_file.clone(),
                    server_socket: info.server_socket.clone(),
                })?;
                self.bootstrap_answered = true;
                Ok(Disposition::Continue)
            }
            Message::Data { payload } => {
                if let Some(reply) = on_payload(&payload) {
                    self.send(&Message::Data { payload: reply })?;
                }
                Ok(Disposition::Continue)
            }
            Message::Reject { reason } => {
                warn!("Peer rejected the session: {}", reason);
                Ok(Disposition::Close)
            }
            other => {
                debug!("Ignoring unexpected {} message", other.kind());
                Ok(Disposition::Continue)
            }
        }
    }

    /// A Hello on a live session starts a new bootstrap exchange.
    fn authenticate(
        &mut self,
        presented: &str,
        secret: Option<&SecretToken>,
    ) -> Result<Disposition> {
        if let Some(expected) = secret {
            if !expected.matches(presented) {
                self.state = SessionState::AwaitingHello;
                return Ok(self.reject("invalid secret"));
            }
        }
        self.state = SessionState::Ready;
        self.bootstrap_answered = false;
        self.send(&Message::HelloAck)?;
        Ok(Disposition::Continue)
    }
}

/// Bind a listener at `path`, replacing a stale socket file but never a live one.
pub fn listen_file(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).is_ok() {
            return Err(DaemonError::Transport(format!(
                "{} is already served by another listener",
                path.display()
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            DaemonError::Transport(format!(
                "cannot remove stale socket {}: {}",
                path.display(),
                e
            ))
        })?;
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| DaemonError::Transport(format!("cannot bind {}: {}", path.display(), e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| DaemonError::Transport(format!("cannot set non-blocking mode: {}", e)))?;
    Ok(listener)
}

/// Endpoint state owned by one multiplexer slot
pub struct ProtocolHandle {
    kind: EndpointKind,
    listener: Option<UnixListener>,
    /// Socket file we bound and must remove
    socket_path: Option<PathBuf>,
    peer_path: Option<PathBuf>,
    secret: Option<SecretToken>,
    bootstrap: Option<BootstrapInfo>,
    connections: Vec<Connection>,
}

impl ProtocolHandle {
    pub fn bind_named(path: &Path, secret: Option<SecretToken>) -> Result<Self> {
        let listener = listen_file(path)?;
        info!(
            "Listening on {} ({})",
            path.display(),
            if secret.is_some() {
                "secret required"
            } else {
                "open"
            }
        );
        Ok(Self {
            kind: EndpointKind::NamedSocket,
            listener: Some(listener),
            socket_path: Some(path.to_path_buf()),
            peer_path: None,
            secret,
            bootstrap: None,
            connections: Vec::new(),
        })
    }

    pub fn over_stream(
        stream: UnixStream,
        peer_path: Option<PathBuf>,
        bootstrap: Option<BootstrapInfo>,
        secret: Option<SecretToken>,
    ) -> Result<Self> {
        let connection = Connection::new(stream, secret.is_some())?;
        Ok(Self {
            kind: EndpointKind::Stream,
            listener: None,
            socket_path: None,
            peer_path,
            secret,
            bootstrap,
            connections: vec![connection],
        })
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Descriptors to watch for readability
    pub fn poll_targets(&self) -> Vec<(RawFd, PollTarget)> {
        let mut targets = Vec::with_capacity(self.connections.len() + 1);
        if let Some(listener) = &self.listener {
            targets.push((listener.as_raw_fd(), PollTarget::Listener));
        }
        for (idx, conn) in self.connections.iter().enumerate() {
            targets.push((conn.fd(), PollTarget::Connection(idx)));
        }
        targets
    }

    /// Accept every pending peer; returns how many were added.
    pub fn accept_pending(&mut self) -> Result<usize> {
        let listener = match &self.listener {
            Some(l) => l,
            None => return Ok(0),
        };

        let mut accepted = 0;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    match Connection::new(stream, self.secret.is_some()) {
                        Ok(conn) => {
                            self.connections.push(conn);
                            accepted += 1;
                        }
                        Err(e) => warn!("Dropping new connection: {}", e),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        Ok(accepted)
    }

    /// Process everything readable on connection `idx`. Ok(false) means it
    /// should be removed.
    pub fn service(
        &mut self,
        idx: usize,
        on_payload: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>,
    ) -> Result<bool> {
        let label = self.label();
        let secret = self.secret.clone();
        let bootstrap = self.bootstrap.clone();
        let conn = self
            .connections
            .get_mut(idx)
            .ok_or_else(|| DaemonError::Transport(format!("no connection {}", idx)))?;

        let open = conn.fill()?;
        loop {
            let message = match conn.next_message()? {
                Some(m) => m,
                None => break,
            };
            match conn.handle_inbound(message, secret.as_ref(), bootstrap.as_ref(), on_payload)? {
                Disposition::Continue => {}
                Disposition::Close => return Ok(false),
                Disposition::Rejected(reason) => {
                    audit::handshake_rejected(&label, &reason);
                    return Ok(false);
                }
            }
        }
        Ok(open)
    }

    pub fn remove_connection(&mut self, idx: usize) {
        if idx < self.connections.len() {
            self.connections.remove(idx);
        }
    }

    /// Send Hello over the stream endpoint and wait for the verdict.
    pub fn present_secret(&mut self, secret: &SecretToken, timeout: Duration) -> Result<()> {
        let conn = self.stream_connection()?;
        conn.send(&Message::Hello {
            secret: secret.expose().to_string(),
        })?;
        loop {
            match conn.recv_timeout(timeout)? {
                Message::HelloAck => return Ok(()),
                Message::Reject { reason } => return Err(DaemonError::Handshake(reason)),
                other => debug!("Skipping {} while awaiting handshake", other.kind()),
            }
        }
    }

    /// Ask the peer for the socket file this process must serve.
    pub fn request_socket_file(&mut self, timeout: Duration) -> Result<BootstrapInfo> {
        let conn = self.stream_connection()?;
        conn.send(&Message::SocketFileRequest)?;
        loop {
            match conn.recv_timeout(timeout)? {
                Message::SocketFileResponse {
                    socket_file,
                    server_socket,
                } => {
                    return Ok(BootstrapInfo {
                        socket_file,
                        server_socket,
                    })
                }
                Message::Reject { reason } => return Err(DaemonError::Handshake(reason)),
                other => debug!("Skipping {} while awaiting socket file", other.kind()),
            }
        }
    }

    fn stream_connection(&mut self) -> Result<&mut Connection> {
        if self.kind != EndpointKind::Stream {
            return Err(DaemonError::Protocol(
                "bootstrap requests need a stream endpoint".into(),
            ));
        }
        self.connections
            .first_mut()
            .ok_or_else(|| DaemonError::Transport("stream endpoint already closed".into()))
    }

    fn label(&self) -> PathBuf {
        self.socket_path
            .clone()
            .or_else(|| self.peer_path.clone())
            .unwrap_or_else(|| PathBuf::from("<socketpair>"))
    }
}

impl Drop for ProtocolHandle {
    fn drop(&mut self) {
        self.connections.clear();
        self.listener.take();
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-side end of a connection; keeps its decoder so frames that
    /// arrive together are not lost between reads.
    struct Peer {
        stream: UnixStream,
        decoder: FrameDecoder,
    }

    impl Peer {
        fn read_reply(&mut self) -> Message {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(m) = self.decoder.next_message().unwrap() {
                    return m;
                }
                let n = self.stream.read(&mut buf).unwrap();
                assert!(n > 0, "peer closed before replying");
                self.decoder.extend(&buf[..n]);
            }
        }

        fn write_msg(&mut self, message: &Message) {
            self.stream.write_all(&encode(message).unwrap()).unwrap();
        }
    }

    fn peer(stream: UnixStream) -> Peer {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Peer {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    fn blocking_pair() -> (UnixStream, Peer) {
        let (a, b) = UnixStream::pair().unwrap();
        (a, peer(b))
    }

    fn no_payloads() -> impl FnMut(&[u8]) -> Option<Vec<u8>> {
        |_: &[u8]| -> Option<Vec<u8>> { panic!("payload must not reach the host") }
    }

    fn bootstrap() -> BootstrapInfo {
        BootstrapInfo {
            socket_file: PathBuf::from("/run/cimd/client.sock"),
            server_socket: PathBuf::from("/etc/cimd/sockets/cimd_abc"),
        }
    }

    #[test]
    fn wrong_secret_is_rejected_before_bootstrap() {
        let (ours, mut peer) = blocking_pair();
        let secret = SecretToken::from_string("right".into());
        let mut handle =
            ProtocolHandle::over_stream(ours, None, Some(bootstrap()), Some(secret)).unwrap();

        peer.write_msg(&Message::Hello { secret: "wrong".into() });
        peer.write_msg(&Message::SocketFileRequest);

        let open = handle.service(0, &mut no_payloads()).unwrap();
        assert!(!open);
        assert!(matches!(peer.read_reply(), Message::Reject { .. }));
    }

    #[test]
    fn bootstrap_without_hello_is_rejected() {
        let (ours, mut peer) = blocking_pair();
        let secret = SecretToken::from_string("right".into());
        let mut handle =
            ProtocolHandle::over_stream(ours, None, Some(bootstrap()), Some(secret)).unwrap();

        peer.write_msg(&Message::SocketFileRequest);
        assert!(!handle.service(0, &mut no_payloads()).unwrap());
        match peer.read_reply() {
            Message::Reject { reason } => assert_eq!(reason, "authentication required"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn correct_secret_then_exactly_one_bootstrap() {
        let (ours, mut peer) = blocking_pair();
        let secret = SecretToken::from_string("right".into());
        let mut handle =
            ProtocolHandle::over_stream(ours, None, Some(bootstrap()), Some(secret)).unwrap();

        peer.write_msg(&Message::Hello { secret: "right".into() });
        peer.write_msg(&Message::SocketFileRequest);
        assert!(handle.service(0, &mut no_payloads()).unwrap());
        assert_eq!(peer.read_reply(), Message::HelloAck);
        assert_eq!(
            peer.read_reply(),
            Message::SocketFileResponse {
                socket_file: bootstrap().socket_file,
                server_socket: bootstrap().server_socket,
            }
        );

        peer.write_msg(&Message::SocketFileRequest);
        assert!(!handle.service(0, &mut no_payloads()).unwrap());
        assert!(matches!(peer.read_reply(), Message::Reject { .. }));
    }

    #[test]
    fn data_is_forwarded_when_no_secret_configured() {
        let (ours, mut peer) = blocking_pair();
        let mut handle = ProtocolHandle::over_stream(ours, None, None, None).unwrap();

        peer.write_msg(&Message::Data { payload: b"ping".to_vec() });
        let mut echo = |p: &[u8]| {
            let mut reply = p.to_vec();
            reply.push(b'!');
            Some(reply)
        };
        assert!(handle.service(0, &mut echo).unwrap());
        assert_eq!(
            peer.read_reply(),
            Message::Data { payload: b"ping!".to_vec() }
        );
    }

    #[test]
    fn peer_close_is_reported() {
        let (ours, peer) = blocking_pair();
        let mut handle = ProtocolHandle::over_stream(ours, None, None, None).unwrap();
        drop(peer);
        assert!(!handle.service(0, &mut no_payloads()).unwrap());
    }

    #[test]
    fn named_socket_refuses_live_listener_and_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.sock");

        let first = ProtocolHandle::bind_named(&path, None).unwrap();
        assert!(matches!(
            ProtocolHandle::bind_named(&path, None),
            Err(DaemonError::Transport(_))
        ));

        // A listener that went away without cleanup leaves a stale file behind.
        let stale = UnixListener::bind(dir.path().join("stale.sock")).unwrap();
        drop(stale);
        let rebound = ProtocolHandle::bind_named(&dir.path().join("stale.sock"), None);
        assert!(rebound.is_ok());

        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn named_socket_accepts_and_authenticates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let secret = SecretToken::from_string("s3cret".into());
        let mut handle = ProtocolHandle::bind_named(&path, Some(secret)).unwrap();

        let mut client = peer(UnixStream::connect(&path).unwrap());
        assert!(wait_for(
            handle.poll_targets()[0].0,
            libc::POLLIN,
            Duration::from_secs(5)
        )
        .unwrap());
        assert_eq!(handle.accept_pending().unwrap(), 1);

        client.write_msg(&Message::Hello { secret: "s3cret".into() });
        assert!(wait_for(
            handle.poll_targets()[1].0,
            libc::POLLIN,
            Duration::from_secs(5)
        )
        .unwrap());
        assert!(handle.service(0, &mut no_payloads()).unwrap());
        assert_eq!(client.read_reply(), Message::HelloAck);
    }

    #[test]
    fn client_side_bootstrap_round_trip() {
        let (engine_end, server_end) = UnixStream::pair().unwrap();
        let secret = SecretToken::from_string("pairsecret".into());

        let server_secret = secret.clone();
        let server = std::thread::spawn(move || {
            let mut handle = ProtocolHandle::over_stream(
                server_end,
                None,
                Some(bootstrap()),
                Some(server_secret),
            )
            .unwrap();
            let fd = handle.poll_targets()[0].0;
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if wait_for(fd, libc::POLLIN, Duration::from_millis(100)).unwrap()
                    && !handle.service(0, &mut no_payloads()).unwrap()
                {
                    break;
                }
            }
        });

        let mut engine = ProtocolHandle::over_stream(engine_end, None, None, None).unwrap();
        engine
            .present_secret(&secret, Duration::from_secs(5))
            .unwrap();
        let info = engine.request_socket_file(Duration::from_secs(5)).unwrap();
        assert_eq!(info, bootstrap());

        drop(engine);
        server.join().unwrap();
    }
}

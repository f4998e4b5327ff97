/// Multiplexer slots and endpoint establishment
///
/// Each slot owns at most one protocol handle. Establishing an endpoint always
/// destroys the slot's previous handle first, so nothing buffered by an old
/// incarnation survives a restart.
use crate::config::types::{DaemonError, Result};
use crate::transport::protocol::{BootstrapInfo, EndpointKind, PollTarget, ProtocolHandle};
use crate::utils::random::SecretToken;
use log::{debug, warn};
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// Client-facing named socket (or the server's engine socket in supervisor mode)
pub const SLOT_NAMED: usize = 0;
/// Socket pair between server and engine
pub const SLOT_PAIR: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxStatus {
    Open,
    /// The stream endpoint's only peer went away
    PeerClosed,
}

/// One readable descriptor reported by `wait_ready`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyEvent {
    pub slot: usize,
    pub target: PollTarget,
    pub revents: libc::c_short,
}

pub struct Multiplexer {
    slot: usize,
    handle: Option<ProtocolHandle>,
}

impl Multiplexer {
    pub fn new(slot: usize) -> Self {
        Self { slot, handle: None }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&ProtocolHandle> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut ProtocolHandle> {
        self.handle.as_mut()
    }

    pub fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(
                "Tearing down slot {} ({:?}, {} connections)",
                self.slot,
                handle.kind(),
                handle.connection_count()
            );
        }
    }

    fn install(&mut self, handle: ProtocolHandle) -> &mut ProtocolHandle {
        self.handle.insert(handle)
    }

    /// Handle readiness reported for this slot.
    pub fn dispatch(
        &mut self,
        ready: &[ReadyEvent],
        on_payload: &mut dyn FnMut(&[u8]) -> Option<Vec<u8>>,
    ) -> Result<MuxStatus> {
        let slot = self.slot;
        let handle = match self.handle.as_mut() {
            Some(h) => h,
            None => return Ok(MuxStatus::Open),
        };
        let kind = handle.kind();
        let mut closed = Vec::new();

        for event in ready.iter().filter(|e| e.slot == slot) {
            match event.target {
                PollTarget::Listener => {
                    let n = handle.accept_pending()?;
                    if n > 0 {
                        debug!("Slot {} accepted {} connection(s)", slot, n);
                    }
                }
                PollTarget::Connection(idx) => match handle.service(idx, on_payload) {
                    Ok(true) => {}
                    Ok(false) => closed.push(idx),
                    Err(e) => {
                        warn!("Slot {} connection {} failed: {}", slot, idx, e);
                        closed.push(idx);
                    }
                },
            }
        }

        if closed.is_empty() {
            return Ok(MuxStatus::Open);
        }
        if kind == EndpointKind::Stream {
            return Ok(MuxStatus::PeerClosed);
        }

        closed.sort_unstable();
        closed.dedup();
        for idx in closed.into_iter().rev() {
            handle.remove_connection(idx);
        }
        Ok(MuxStatus::Open)
    }
}

/// Bind a protocol handle to an already-connected stream.
///
/// `peer` is what this side answers to a socket-file request; `secret`, when
/// present, must be proven by the peer first.
pub fn listen_on_stream_endpoint(
    mux: &mut Multiplexer,
    endpoint: UnixStream,
    peer: Option<BootstrapInfo>,
    secret: Option<SecretToken>,
) -> Result<&mut ProtocolHandle> {
    mux.teardown();
    let peer_path = peer.as_ref().map(|p| p.server_socket.clone());
    let handle = ProtocolHandle::over_stream(endpoint, peer_path, peer, secret)?;
    Ok(mux.install(handle))
}

/// Bind a protocol handle to a named socket file.
pub fn listen_on_named_socket<'a>(
    mux: &'a mut Multiplexer,
    path: &Path,
    secret: Option<SecretToken>,
) -> Result<&'a mut ProtocolHandle> {
    mux.teardown();
    let handle = ProtocolHandle::bind_named(path, secret)?;
    Ok(mux.install(handle))
}

/// Block until any active slot has a readable descriptor. None when the wait
/// was interrupted by a signal or timed out with nothing ready.
pub fn wait_ready(muxes: &[Multiplexer], timeout: Duration) -> Result<Option<Vec<ReadyEvent>>> {
    wait_ready_with_wake(muxes, None, timeout)
}

/// `wait_ready` that also returns None as soon as `wake` becomes readable.
/// The caller drains `wake`.
pub fn wait_ready_with_wake(
    muxes: &[Multiplexer],
    wake: Option<RawFd>,
    timeout: Duration,
) -> Result<Option<Vec<ReadyEvent>>> {
    let mut index = Vec::new();
    let mut fds = Vec::new();
    if let Some(fd) = wake {
        index.push(None);
        fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    for mux in muxes {
        if let Some(handle) = mux.handle() {
            for (fd, target) in handle.poll_targets() {
                index.push(Some((mux.slot(), target)));
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
        }
    }

    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    if fds.is_empty() {
        std::thread::sleep(Duration::from_millis(millis as u64));
        return Ok(None);
    }

    // SAFETY: `fds` is a valid, exclusively borrowed array for the call.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(DaemonError::Transport(format!("poll failed: {}", err)));
    }
    if rc == 0 {
        return Ok(None);
    }

    let ready: Vec<ReadyEvent> = fds
        .iter()
        .zip(index)
        .filter(|(pfd, _)| pfd.revents != 0)
        .filter_map(|(pfd, entry)| {
            entry.map(|(slot, target)| ReadyEvent {
                slot,
                target,
                revents: pfd.revents,
            })
        })
        .collect();
    Ok((!ready.is_empty()).then_some(ready))
}

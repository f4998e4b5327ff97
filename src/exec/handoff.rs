/// Typed channel handoff across exec
///
/// The engine receives its inherited descriptor number as `--socketpair <fd>`
/// and the per-cycle secret in `CIMD_HANDOFF_SECRET`. On the engine side the
/// variable is removed as soon as it has been read.
use crate::config::types::{DaemonError, Result};
use crate::utils::env_hygiene::take_var;
use crate::utils::random::SecretToken;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

pub const SOCKETPAIR_FLAG: &str = "--socketpair";
pub const SECRET_ENV: &str = "CIMD_HANDOFF_SECRET";

/// Server options that must not reach the engine
const STRIPPED_FLAGS: [&str; 3] = ["--nonroot", "-d", "--daemonize"];

#[derive(Debug)]
pub struct ChannelHandoff {
    pub fd: RawFd,
    pub secret: Option<SecretToken>,
}

impl ChannelHandoff {
    pub fn new(fd: RawFd, secret: Option<SecretToken>) -> Self {
        Self { fd, secret }
    }

    /// Engine side: pick up the inherited channel and scrub the secret.
    pub fn from_inherited(fd: RawFd) -> Self {
        let secret = take_var(SECRET_ENV)
            .filter(|s| !s.is_empty())
            .map(SecretToken::from_string);
        Self { fd, secret }
    }

    pub fn args(&self) -> [String; 2] {
        [SOCKETPAIR_FLAG.to_string(), self.fd.to_string()]
    }

    pub fn env(&self) -> Option<(&'static str, &str)> {
        self.secret.as_ref().map(|s| (SECRET_ENV, s.expose()))
    }

    /// Adopt the descriptor as a stream. Fails unless it is an open socket.
    pub fn into_stream(self) -> Result<(UnixStream, Option<SecretToken>)> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fstat writes into a stat buffer we own.
        if unsafe { libc::fstat(self.fd, &mut st) } != 0 {
            return Err(DaemonError::Transport(format!(
                "inherited descriptor {} is not open: {}",
                self.fd,
                std::io::Error::last_os_error()
            )));
        }
        if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
            return Err(DaemonError::Transport(format!(
                "inherited descriptor {} is not a socket",
                self.fd
            )));
        }

        // Keep the channel out of anything this process execs later.
        // SAFETY: flag update on an open descriptor.
        unsafe { libc::fcntl(self.fd, libc::F_SETFD, libc::FD_CLOEXEC) };

        // SAFETY: the descriptor was handed to this process for exclusive use.
        let stream = unsafe { UnixStream::from_raw_fd(self.fd) };
        Ok((stream, self.secret))
    }
}

/// Engine command line: `engine_binary`, the server arguments minus
/// server-only flags and any stale handoff, then the handoff itself.
pub fn engine_argv(engine_binary: &str, server_args: &[String], handoff: &ChannelHandoff) -> Vec<String> {
    let mut argv = vec![engine_binary.to_string()];
    let mut args = server_args.iter();
    while let Some(arg) = args.next() {
        if arg == SOCKETPAIR_FLAG {
            args.next();
            continue;
        }
        if arg.starts_with("--socketpair=") || STRIPPED_FLAGS.contains(&arg.as_str()) {
            continue;
        }
        argv.push(arg.clone());
    }
    argv.extend(handoff.args());
    argv
}

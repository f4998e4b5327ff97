use crate::config::types::{DaemonError, Result};
use crate::kernel::credentials::transition_to_service_account;
use crate::utils::fd_closure::seal_descriptors_except;
/// Engine child pre-exec sequence
///
/// Runs between fork and exec. The order is fixed:
/// 1. drop the parent's end of the pair (done by the launcher)
/// 2. setgroups, setresgid, setresuid to the service account (root only)
/// 3. close every inherited descriptor >= 3 except the channel
/// 4. restore default SIGPIPE disposition and exec the engine image
///
/// Each step consumes the prior state, so an exec without the privilege drop
/// and the descriptor seal cannot be written.
use std::convert::Infallible;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Type-state marker: fresh child, still holding the parent's credentials
pub struct Forked;

/// Type-state marker: running as the service account (or never privileged)
pub struct PrivilegesDropped;

/// Type-state marker: only stdio and the channel remain open
pub struct Sealed;

/// Everything execve needs, built before fork so the child does not allocate
#[derive(Debug)]
pub struct ExecImage {
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ExecImage {
    pub fn prepare(binary: &Path, argv: &[String], envp: Vec<CString>) -> Result<Self> {
        let path = CString::new(binary.as_os_str().as_bytes()).map_err(|_| {
            DaemonError::Config(format!("engine path contains NUL: {}", binary.display()))
        })?;
        let argv = argv
            .iter()
            .map(|a| {
                CString::new(a.as_str())
                    .map_err(|_| DaemonError::Config(format!("argument contains NUL: {:?}", a)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { path, argv, envp })
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }
}

/// Engine child with type-state tracking
pub struct EngineChild<S> {
    channel_fd: RawFd,
    _state: PhantomData<S>,
}

impl EngineChild<Forked> {
    pub fn new(channel_fd: RawFd) -> Self {
        Self {
            channel_fd,
            _state: PhantomData,
        }
    }

    /// `target` is None when the server itself is not root; there is nothing
    /// to drop and setuid would fail.
    pub fn drop_privileges(self, target: Option<(u32, u32)>) -> Result<EngineChild<PrivilegesDropped>> {
        if let Some((uid, gid)) = target {
            transition_to_service_account(uid, gid)?;
        }
        Ok(EngineChild {
            channel_fd: self.channel_fd,
            _state: PhantomData,
        })
    }
}

impl EngineChild<PrivilegesDropped> {
    pub fn seal_descriptors(self) -> Result<EngineChild<Sealed>> {
        seal_descriptors_except(self.channel_fd).map_err(|errno| {
            DaemonError::Process(format!(
                "cannot keep channel descriptor {}: errno {}",
                self.channel_fd, errno
            ))
        })?;
        Ok(EngineChild {
            channel_fd: self.channel_fd,
            _state: PhantomData,
        })
    }
}

impl EngineChild<Sealed> {
    /// Only returns on failure.
    pub fn exec(self, image: &ExecImage) -> Result<Infallible> {
        // SAFETY: resetting a disposition; exec would keep SIG_IGN otherwise.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
        nix::unistd::execve(&image.path, &image.argv, &image.envp).map_err(|e| {
            DaemonError::Process(format!(
                "failed to exec {}: {}",
                image.path.to_string_lossy(),
                e
            ))
        })
    }
}

/// Body of the forked engine child. Never returns into shared code.
pub fn run_engine_child(channel_fd: RawFd, target: Option<(u32, u32)>, image: &ExecImage) -> ! {
    let outcome = EngineChild::new(channel_fd)
        .drop_privileges(target)
        .and_then(|child| child.seal_descriptors())
        .and_then(|child| child.exec(image));

    let message = match outcome {
        Ok(never) => match never {},
        Err(e) => format!("cimengine launch failed: {}\n", e),
    };
    // SAFETY: write(2) to stderr and _exit are async-signal-safe.
    unsafe {
        libc::write(2, message.as_ptr().cast(), message.len());
        libc::_exit(127)
    }
}

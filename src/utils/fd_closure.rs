/// File descriptor sealing for the engine child
///
/// Runs between fork and exec, so the sweep must not allocate: close_range
/// first, then a bounded close() loop. Descriptors 0-2 are always kept.
use std::os::unix::io::RawFd;

/// Descriptors below this are never closed
pub const FD_SAFETY_FLOOR: RawFd = 3;

/// Upper bound for the fallback sweep
pub const FD_SWEEP_LIMIT: RawFd = 2500;

/// Close every descriptor >= 3 except `keep`, then clear CLOEXEC on `keep`.
///
/// Async-signal-safe. Returns the raw errno on failure so the forked child can
/// report it without formatting.
pub fn seal_descriptors_except(keep: RawFd) -> std::result::Result<(), i32> {
    if keep >= FD_SAFETY_FLOOR {
        close_span(FD_SAFETY_FLOOR, keep - 1);
        close_span(keep + 1, RawFd::MAX);
    } else {
        close_span(FD_SAFETY_FLOOR, RawFd::MAX);
    }

    // SAFETY: plain fcntl on a descriptor number; no memory is touched.
    let rc = unsafe { libc::fcntl(keep, libc::F_SETFD, 0) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EBADF));
    }
    Ok(())
}

fn close_span(first: RawFd, last: RawFd) {
    if first > last {
        return;
    }

    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range only closes descriptors in the span.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                last as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if rc == 0 {
            return;
        }
    }

    // SAFETY: getdtablesize has no preconditions.
    let table = unsafe { libc::getdtablesize() };
    let upper = last.min(table.min(FD_SWEEP_LIMIT) - 1);
    let mut fd = first;
    while fd <= upper {
        // SAFETY: closing a descriptor we do not otherwise reference; EBADF is harmless.
        unsafe {
            libc::close(fd);
        }
        fd += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{DaemonError, Result};
    use std::fs;

    /// Currently open descriptors of this process
    fn get_open_fds() -> Result<Vec<RawFd>> {
        let fd_dir = "/proc/self/fd";

        let entries = fs::read_dir(fd_dir)
            .map_err(|e| DaemonError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

        let mut fds: Vec<RawFd> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| name.parse::<RawFd>().ok())
            .collect();

        fds.sort_unstable();
        Ok(fds)
    }

    /// Whether `fd` has FD_CLOEXEC set
    fn is_cloexec(fd: RawFd) -> Result<bool> {
        // SAFETY: F_GETFD reads descriptor flags only.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(flags & libc::FD_CLOEXEC != 0)
    }

    #[test]
    fn test_get_open_fds() {
        let fds = get_open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn std_sockets_are_cloexec() {
        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        use std::os::unix::io::AsRawFd;
        assert!(is_cloexec(a.as_raw_fd()).unwrap());
    }

    #[test]
    fn seal_in_child_keeps_only_retained_fd() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};
        use std::os::unix::io::AsRawFd;

        let (keep, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let extra = std::fs::File::open("/dev/null").unwrap();
        let keep_fd = keep.as_raw_fd();
        let extra_fd = extra.as_raw_fd();

        // SAFETY: the child only makes raw syscalls before _exit.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match seal_descriptors_except(keep_fd) {
                    Err(_) => 10,
                    Ok(()) => {
                        let keep_flags = unsafe { libc::fcntl(keep_fd, libc::F_GETFD) };
                        let extra_flags = unsafe { libc::fcntl(extra_fd, libc::F_GETFD) };
                        let stderr_flags = unsafe { libc::fcntl(2, libc::F_GETFD) };
                        if keep_flags != 0 {
                            11
                        } else if extra_flags != -1 {
                            12
                        } else if stderr_flags == -1 {
                            13
                        } else {
                            0
                        }
                    }
                };
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
            }
        }
    }
}

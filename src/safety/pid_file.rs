/// PID file: single-instance enforcement and signal delivery by PID
///
/// The writer holds an exclusive flock on the file for its whole lifetime;
/// readers treat a live PID recorded in the file as "running".
use crate::config::types::{DaemonError, Result};
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// PID file at a well-known path
#[derive(Clone, Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the file, if any
    pub fn read_pid(&self) -> Result<Option<Pid>> {
        let mut content = String::new();
        match File::open(&self.path) {
            Ok(mut f) => {
                f.read_to_string(&mut content)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(Pid::from_raw(pid))),
            _ => {
                warn!("Ignoring malformed PID file {}", self.path.display());
                Ok(None)
            }
        }
    }

    /// PID of the running instance, or None when no live process owns the file
    pub fn running_pid(&self) -> Result<Option<Pid>> {
        let pid = match self.read_pid()? {
            Some(pid) => pid,
            None => return Ok(None),
        };

        match kill(pid, None) {
            Ok(()) => Ok(Some(pid)),
            // Alive but owned by someone else
            Err(Errno::EPERM) => Ok(Some(pid)),
            Err(Errno::ESRCH) => Ok(None),
            Err(e) => Err(DaemonError::Process(format!("kill({}, 0): {}", pid, e))),
        }
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.running_pid()?.is_some())
    }

    /// Deliver `sig` to the running instance.
    pub fn signal(&self, sig: Signal) -> Result<Pid> {
        let pid = self.running_pid()?.ok_or(DaemonError::NotRunning)?;
        kill(pid, sig).map_err(|e| DaemonError::Signal(format!("kill({}, {}): {}", pid, sig, e)))?;
        info!("Sent {} to pid {}", sig, pid);
        Ok(pid)
    }

    /// Become the single writer. Fails with `AlreadyRunning` if another
    /// live instance holds the file.
    pub fn acquire(&self) -> Result<PidFileGuard> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&self.path)
            .map_err(|e| {
                DaemonError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Could not create pid file {}: {}", self.path.display(), e),
                ))
            })?;

        // SAFETY: flock on a descriptor we own.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let pid = self
                .read_pid()
                .ok()
                .flatten()
                .map(|p| p.as_raw())
                .unwrap_or(0);
            return Err(DaemonError::AlreadyRunning { pid });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(PidFileGuard {
            path: self.path.clone(),
            file: Some(file),
        })
    }
}

/// Held by the running instance; removes the file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
    file: Option<File>,
}

impl PidFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        // Lock is released when the descriptor closes.
        self.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("cimserver.pid"));
        assert!(!pid_file.is_running().unwrap());
        assert!(matches!(
            pid_file.signal(Signal::SIGHUP),
            Err(DaemonError::NotRunning)
        ));
    }

    #[test]
    fn acquire_writes_own_pid_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/cimserver.pid");
        let pid_file = PidFile::new(&path);

        {
            let _guard = pid_file.acquire().unwrap();
            assert_eq!(
                pid_file.read_pid().unwrap(),
                Some(Pid::from_raw(std::process::id() as i32))
            );
            assert!(pid_file.is_running().unwrap());
        }
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("cimserver.pid"));
        let _guard = pid_file.acquire().unwrap();

        let err = pid_file.acquire().unwrap_err();
        match err {
            DaemonError::AlreadyRunning { pid } => assert_eq!(pid, std::process::id() as i32),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stale_pid_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cimserver.pid");
        // pid_max on Linux never reaches this value
        std::fs::write(&path, "2147483646\n").unwrap();
        assert!(!PidFile::new(&path).is_running().unwrap());
    }

    #[test]
    fn malformed_pid_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cimserver.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert_eq!(PidFile::new(&path).read_pid().unwrap(), None);
    }
}

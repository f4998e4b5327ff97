//! Well-known filesystem locations.
//!
//! Path resolution itself belongs to the surrounding installation; the core
//! only consumes it through [`PathResolver`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolves the paths the bootstrap core touches
pub trait PathResolver {
    /// Client-facing socket file
    fn socket_file(&self) -> &Path;
    /// TLS private key
    fn key_file(&self) -> &Path;
    fn auth_dir(&self) -> &Path;
    fn local_state_dir(&self) -> &Path;
    fn pid_file(&self) -> &Path;
    fn bin_dir(&self) -> &Path;
    fn run_dir(&self) -> &Path;
    fn sysconf_dir(&self) -> &Path;

    /// Directory holding the per-incarnation socket files
    fn sockets_dir(&self) -> PathBuf {
        self.sysconf_dir().join("sockets")
    }

    /// Engine executable exec'd by the launcher
    fn engine_binary(&self) -> PathBuf {
        self.bin_dir().join("cimengine")
    }

    fn log_dir(&self) -> PathBuf {
        self.local_state_dir().join("log")
    }

    /// Log file written by `program` unless it logs to stderr
    fn log_file(&self, program: &str) -> PathBuf {
        self.log_dir().join(format!("{}.log", program))
    }
}

/// Default layout, overridable from the config file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonPaths {
    pub socket_file: PathBuf,
    pub key_file: PathBuf,
    pub auth_dir: PathBuf,
    pub local_state_dir: PathBuf,
    pub pid_file: PathBuf,
    pub bin_dir: PathBuf,
    pub run_dir: PathBuf,
    pub sysconf_dir: PathBuf,
}

impl Default for DaemonPaths {
    fn default() -> Self {
        Self {
            socket_file: PathBuf::from("/var/opt/cimd/run/cimd.socket"),
            key_file: PathBuf::from("/etc/opt/cimd/ssl/cimkey.pem"),
            auth_dir: PathBuf::from("/var/opt/cimd/auth"),
            local_state_dir: PathBuf::from("/var/opt/cimd"),
            pid_file: PathBuf::from("/var/opt/cimd/run/cimserver.pid"),
            bin_dir: PathBuf::from("/opt/cimd/bin"),
            run_dir: PathBuf::from("/var/opt/cimd/run"),
            sysconf_dir: PathBuf::from("/etc/opt/cimd/conf"),
        }
    }
}

impl DaemonPaths {
    /// Re-root every path under `destdir` (staged installs, tests).
    pub fn with_destdir(&self, destdir: &Path) -> Self {
        let reroot = |p: &Path| destdir.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            socket_file: reroot(&self.socket_file),
            key_file: reroot(&self.key_file),
            auth_dir: reroot(&self.auth_dir),
            local_state_dir: reroot(&self.local_state_dir),
            pid_file: reroot(&self.pid_file),
            bin_dir: reroot(&self.bin_dir),
            run_dir: reroot(&self.run_dir),
            sysconf_dir: reroot(&self.sysconf_dir),
        }
    }

    /// Lines printed by `--locations`.
    pub fn describe(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("socketfile", &self.socket_file),
            ("keyfile", &self.key_file),
            ("authdir", &self.auth_dir),
            ("localstatedir", &self.local_state_dir),
            ("pidfile", &self.pid_file),
            ("bindir", &self.bin_dir),
            ("rundir", &self.run_dir),
            ("sysconfdir", &self.sysconf_dir),
        ]
    }
}

impl PathResolver for DaemonPaths {
    fn socket_file(&self) -> &Path {
        &self.socket_file
    }
    fn key_file(&self) -> &Path {
        &self.key_file
    }
    fn auth_dir(&self) -> &Path {
        &self.auth_dir
    }
    fn local_state_dir(&self) -> &Path {
        &self.local_state_dir
    }
    fn pid_file(&self) -> &Path {
        &self.pid_file
    }
    fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }
    fn run_dir(&self) -> &Path {
        &self.run_dir
    }
    fn sysconf_dir(&self) -> &Path {
        &self.sysconf_dir
    }
}

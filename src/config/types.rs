/// Core types shared by the server and engine roles
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Custom error types for cimd
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("invalid service account: {0}")]
    InvalidServiceAccount(String),

    #[error("server is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    #[error("server is not running")]
    NotRunning,

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Too many files are changing ownership (capacity {capacity})")]
    OwnershipLedgerFull { capacity: usize },

    #[error("Process error: {0}")]
    Process(String),

    #[error("Signal error: {0}")]
    Signal(String),
}

impl DaemonError {
    /// Transport-level failures restart the control loop; everything else is fatal.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            DaemonError::Transport(_) | DaemonError::Protocol(_) | DaemonError::Handshake(_)
        )
    }
}

impl From<nix::errno::Errno> for DaemonError {
    fn from(err: nix::errno::Errno) -> Self {
        DaemonError::Process(err.to_string())
    }
}

/// Result type alias for cimd operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Unprivileged identity the engine runs as
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl ServiceAccount {
    /// Look up `name` in the user database.
    pub fn resolve(name: &str) -> Result<Self> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| DaemonError::InvalidServiceAccount(format!("{}: {}", name, e)))?
            .ok_or_else(|| DaemonError::InvalidServiceAccount(format!("{}: no such user", name)))?;

        let account = Self {
            name: name.to_string(),
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        };
        account.validate()?;
        Ok(account)
    }

    /// Root (or unset) ids can never be a service account.
    pub fn validate(&self) -> Result<()> {
        if self.uid == 0 || self.gid == 0 {
            return Err(DaemonError::InvalidServiceAccount(format!(
                "{} resolves to a privileged identity (uid={}, gid={})",
                self.name, self.uid, self.gid
            )));
        }
        Ok(())
    }
}

/// One-shot request carried by the startup options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    Start,
    Stop,
    Reload,
    ReloadDispatcher,
}

/// Restart backoff applied between control-loop cycles
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A cycle that served at least this long resets the backoff
    pub healthy_after_ms: u64,
    /// None retries forever
    pub max_consecutive: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            healthy_after_ms: 10_000,
            max_consecutive: None,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn healthy_after(&self) -> Duration {
        Duration::from_millis(self.healthy_after_ms)
    }
}

/// Startup options, immutable once parsed
#[derive(Clone, Debug, Default)]
pub struct RuntimeOptions {
    pub daemonize: bool,
    pub non_root: bool,
    pub stop: bool,
    pub reload_config: bool,
    pub reload_dispatcher: bool,
    /// Account name as given; resolved lazily in non-root mode
    pub service_account_name: Option<String>,
    pub ntlm_cred_file: Option<PathBuf>,
    pub ignore_authentication: bool,
    pub restart: RestartPolicy,
}

impl RuntimeOptions {
    /// Stop wins over reload, reload over reload-dispatcher.
    pub fn control_request(&self) -> ControlRequest {
        if self.stop {
            ControlRequest::Stop
        } else if self.reload_config {
            ControlRequest::Reload
        } else if self.reload_dispatcher {
            ControlRequest::ReloadDispatcher
        } else {
            ControlRequest::Start
        }
    }
}

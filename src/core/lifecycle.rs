/// One-shot control requests against a running instance
///
/// `-s`, `-r` and `--reload-dispatcher` never start a daemon: they consult the
/// PID file, deliver a signal, and report.
use crate::config::types::{ControlRequest, DaemonError, Result};
use crate::safety::pid_file::PidFile;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Result of a control request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Start request and no live instance: carry on starting
    Proceed,
    Signaled {
        request: ControlRequest,
        pid: Pid,
        signal: Signal,
    },
    /// Nothing to stop or reload
    NotRunning(ControlRequest),
}

impl ControlOutcome {
    pub fn message(&self) -> String {
        match self {
            ControlOutcome::Proceed => "starting".to_string(),
            ControlOutcome::Signaled { request, pid, .. } => match request {
                ControlRequest::Stop => format!("Stopping server (pid {})", pid),
                ControlRequest::Reload => format!("Reloading configuration of server (pid {})", pid),
                ControlRequest::ReloadDispatcher => {
                    format!("Reloading dispatcher of server (pid {})", pid)
                }
                ControlRequest::Start => format!("Server running (pid {})", pid),
            },
            ControlOutcome::NotRunning(_) => "server is not running".to_string(),
        }
    }
}

pub fn signal_for(request: ControlRequest) -> Option<Signal> {
    match request {
        ControlRequest::Start => None,
        ControlRequest::Stop => Some(Signal::SIGTERM),
        ControlRequest::Reload => Some(Signal::SIGHUP),
        ControlRequest::ReloadDispatcher => Some(Signal::SIGUSR1),
    }
}

/// Consult the PID file and act on `request`.
///
/// Starting while an instance is alive fails with `AlreadyRunning` before
/// anything is bound.
pub fn dispatch_control_request(request: ControlRequest, pid_file: &PidFile) -> Result<ControlOutcome> {
    let signal = match signal_for(request) {
        Some(signal) => signal,
        None => {
            return match pid_file.running_pid()? {
                Some(pid) => Err(DaemonError::AlreadyRunning { pid: pid.as_raw() }),
                None => Ok(ControlOutcome::Proceed),
            }
        }
    };

    match pid_file.signal(signal) {
        Ok(pid) => Ok(ControlOutcome::Signaled {
            request,
            pid,
            signal,
        }),
        Err(DaemonError::NotRunning) => Ok(ControlOutcome::NotRunning(request)),
        Err(e) => Err(e),
    }
}

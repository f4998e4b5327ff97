use crate::kernel::signal::SignalController;
use crate::observability::audit;
use crate::transport::mux::{Multiplexer, SLOT_NAMED, SLOT_PAIR};
/// Per-process runtime state threaded through the control loop
///
/// Created once per process. The multiplexer slots are torn down and rebuilt
/// on every restart; `terminated` only ever flips through the signal
/// controller.
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How an engine child ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineExit {
    Exited(i32),
    Signaled(i32),
}

impl EngineExit {
    pub fn describe(&self) -> String {
        match self {
            EngineExit::Exited(code) => format!("exited with status {}", code),
            EngineExit::Signaled(sig) => format!("killed by signal {}", sig),
        }
    }
}

/// Signals sent while stopping the engine
#[derive(Clone, Debug, Default)]
pub struct StopReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub exit: Option<EngineExit>,
    pub waited_ms: u64,
}

pub struct ServerRuntimeState {
    terminated: bool,
    pub engine_pid: Option<Pid>,
    pub mux: [Multiplexer; 2],
    incarnation: Uuid,
    cycles: u64,
}

impl Default for ServerRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRuntimeState {
    pub fn new() -> Self {
        Self {
            terminated: false,
            engine_pid: None,
            mux: [Multiplexer::new(SLOT_NAMED), Multiplexer::new(SLOT_PAIR)],
            incarnation: audit::incarnation(),
            cycles: 0,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Latch `terminated` from the signal controller.
    pub fn observe_signals(&mut self, signals: &SignalController) -> bool {
        if signals.terminate_requested() {
            self.terminated = true;
        }
        self.terminated
    }

    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub(crate) fn begin_cycle(&mut self) -> u64 {
        self.cycles += 1;
        self.cycles
    }

    /// Destroy both protocol handles.
    pub fn teardown_transport(&mut self) {
        for mux in self.mux.iter_mut() {
            mux.teardown();
        }
    }

    /// Collect the engine if it has exited. Clears `engine_pid` when it has.
    pub fn reap_engine(&mut self) -> Option<EngineExit> {
        let pid = self.engine_pid?;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => return Some(self.engine_gone(pid, EngineExit::Exited(code))),
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    return Some(self.engine_gone(pid, EngineExit::Signaled(sig as i32)))
                }
                Ok(WaitStatus::StillAlive) => return None,
                Ok(_) => return None,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    debug!("Engine {} already collected", pid);
                    self.engine_pid = None;
                    return None;
                }
                Err(e) => {
                    warn!("waitpid({}) failed: {}", pid, e);
                    return None;
                }
            }
        }
    }

    fn engine_gone(&mut self, pid: Pid, exit: EngineExit) -> EngineExit {
        info!("Engine {} {}", pid, exit.describe());
        audit::engine_exited(pid.as_raw(), &exit.describe());
        self.engine_pid = None;
        exit
    }

    /// Forward `sig` to the running engine. False when there is none or
    /// delivery failed.
    pub fn signal_engine(&self, sig: Signal) -> bool {
        let pid = match self.engine_pid {
            Some(pid) => pid,
            None => return false,
        };
        match kill(pid, sig) {
            Ok(()) => {
                debug!("Forwarded {} to engine {}", sig, pid);
                true
            }
            Err(e) => {
                warn!("Cannot forward {} to engine {}: {}", sig, pid, e);
                false
            }
        }
    }

    /// SIGTERM the engine, wait up to `grace`, then SIGKILL.
    pub fn stop_engine(&mut self, grace: Duration) -> StopReport {
        let mut report = StopReport::default();
        let pid = match self.engine_pid {
            Some(pid) => pid,
            None => return report,
        };
        let start = Instant::now();

        if let Some(exit) = self.reap_engine() {
            report.exit = Some(exit);
            return report;
        }

        report.term_sent = kill(pid, Signal::SIGTERM).is_ok();
        while start.elapsed() < grace {
            if let Some(exit) = self.reap_engine() {
                report.exit = Some(exit);
                report.waited_ms = start.elapsed().as_millis() as u64;
                return report;
            }
            if self.engine_pid.is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        if self.engine_pid.is_some() {
            warn!("Engine {} ignored SIGTERM; sending SIGKILL", pid);
            report.kill_sent = kill(pid, Signal::SIGKILL).is_ok();
            loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => {
                        report.exit = Some(self.engine_gone(pid, EngineExit::Exited(code)));
                        break;
                    }
                    Ok(WaitStatus::Signaled(_, sig, _)) => {
                        report.exit = Some(self.engine_gone(pid, EngineExit::Signaled(sig as i32)));
                        break;
                    }
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(_) => {
                        self.engine_pid = None;
                        break;
                    }
                }
            }
        }

        report.waited_ms = start.elapsed().as_millis() as u64;
        report
    }
}

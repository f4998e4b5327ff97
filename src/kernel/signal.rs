use crate::config::types::{DaemonError, Result};
use log::{info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe lifecycle signal handling
///
/// Handlers only touch atomics and write one byte to a wake pipe: no
/// allocations, no locks. The main loop drains the recorded events and
/// performs the actual transitions.
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Signals the daemon reacts to
const LIFECYCLE_SIGNALS: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGCHLD,
];

/// Event recorded by a handler and applied later by the main loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// SIGTERM / SIGINT: graceful stop
    Terminate,
    /// SIGHUP: reload configuration
    ReloadConfig,
    /// SIGUSR1: reload protocol dispatch, keep providers loaded
    ReloadDispatcher,
    /// SIGCHLD: reap the engine child
    ChildExited,
}

impl LifecycleEvent {
    pub fn from_signal(sig: Signal) -> Option<Self> {
        match sig {
            Signal::SIGTERM | Signal::SIGINT => Some(Self::Terminate),
            Signal::SIGHUP => Some(Self::ReloadConfig),
            Signal::SIGUSR1 => Some(Self::ReloadDispatcher),
            Signal::SIGCHLD => Some(Self::ChildExited),
            _ => None,
        }
    }
}

/// Pending-event counters shared between a handler and the main loop
#[derive(Debug)]
pub struct SignalFlags {
    terminate: AtomicBool,
    reload: AtomicU32,
    reload_dispatcher: AtomicU32,
    child_exited: AtomicU32,
    /// Signal number that requested termination (0 if none)
    stop_signal: AtomicI32,
    wake_read: AtomicI32,
    wake_write: AtomicI32,
}

impl SignalFlags {
    pub const fn new() -> Self {
        Self {
            terminate: AtomicBool::new(false),
            reload: AtomicU32::new(0),
            reload_dispatcher: AtomicU32::new(0),
            child_exited: AtomicU32::new(0),
            stop_signal: AtomicI32::new(0),
            wake_read: AtomicI32::new(-1),
            wake_write: AtomicI32::new(-1),
        }
    }

    /// Create the non-blocking wake pipe once. Every recorded event writes a
    /// byte to it, so a poll that includes the read end returns immediately.
    pub fn arm_wake_pipe(&self) -> Result<()> {
        if self.wake_read.load(Ordering::SeqCst) >= 0 {
            return Ok(());
        }
        let mut fds = [-1 as libc::c_int; 2];
        // SAFETY: `fds` is a valid two-element array for the call.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc == -1 {
            return Err(DaemonError::Signal(format!(
                "cannot create wake pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        if self
            .wake_read
            .compare_exchange(-1, fds[0], Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // SAFETY: closing the pair created above, never shared.
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Ok(());
        }
        self.wake_write.store(fds[1], Ordering::SeqCst);
        Ok(())
    }

    /// Async-signal-safe.
    fn wake(&self) {
        let fd = self.wake_write.load(Ordering::SeqCst);
        if fd >= 0 {
            let byte = 1u8;
            // SAFETY: write(2) is async-signal-safe; a full pipe (EAGAIN) already wakes.
            unsafe {
                libc::write(fd, (&byte as *const u8).cast(), 1);
            }
        }
    }

    /// Async-signal-safe.
    fn record(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Terminate => self.terminate.store(true, Ordering::SeqCst),
            LifecycleEvent::ReloadConfig => {
                self.reload.fetch_add(1, Ordering::SeqCst);
            }
            LifecycleEvent::ReloadDispatcher => {
                self.reload_dispatcher.fetch_add(1, Ordering::SeqCst);
            }
            LifecycleEvent::ChildExited => {
                self.child_exited.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.wake();
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Flags written by the installed process handler
static PROCESS_FLAGS: SignalFlags = SignalFlags::new();

extern "C" fn lifecycle_signal_handler(raw: libc::c_int) {
    if let Ok(sig) = Signal::try_from(raw) {
        if let Some(event) = LifecycleEvent::from_signal(sig) {
            if event == LifecycleEvent::Terminate {
                PROCESS_FLAGS.stop_signal.store(raw, Ordering::SeqCst);
            }
            PROCESS_FLAGS.record(event);
        }
    }
}

/// Maps external signals onto lifecycle events for one process
#[derive(Clone, Copy, Debug)]
pub struct SignalController {
    flags: &'static SignalFlags,
}

impl SignalController {
    /// Install handlers for the lifecycle signals.
    ///
    /// Handlers are installed without SA_RESTART so a blocked poll returns
    /// EINTR promptly. A failing SIGCHLD install is only logged; the engine
    /// crash still surfaces as a closed channel.
    pub fn install() -> Result<Self> {
        PROCESS_FLAGS.arm_wake_pipe()?;
        let action = SigAction::new(
            SigHandler::Handler(lifecycle_signal_handler),
            SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );

        for sig in LIFECYCLE_SIGNALS {
            // SAFETY: the handler only performs atomic stores.
            let installed = unsafe { signal::sigaction(sig, &action) };
            match installed {
                Ok(_) => {}
                Err(e) if sig == Signal::SIGCHLD => {
                    warn!("Failed to install SIGCHLD handler: {}", e);
                }
                Err(e) => {
                    return Err(DaemonError::Signal(format!(
                        "cannot set handler for {}: {}",
                        sig, e
                    )))
                }
            }
        }

        // Writes to a dead peer must surface as EPIPE, not kill the process.
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { signal::sigaction(Signal::SIGPIPE, &ignore) }
            .map_err(|e| DaemonError::Signal(format!("cannot ignore SIGPIPE: {}", e)))?;

        info!("Signal handlers installed (SIGTERM, SIGINT, SIGHUP, SIGUSR1, SIGCHLD)");
        Ok(Self {
            flags: &PROCESS_FLAGS,
        })
    }

    /// Controller over caller-owned flags; no handlers are installed.
    pub fn detached(flags: &'static SignalFlags) -> Self {
        Self { flags }
    }

    /// Record an event as if its signal had arrived.
    pub fn raise(&self, event: LifecycleEvent) {
        self.flags.record(event);
    }

    pub fn terminate_requested(&self) -> bool {
        self.flags.terminate.load(Ordering::SeqCst)
    }

    /// Signal that requested termination (0 if none arrived)
    pub fn stop_signal(&self) -> i32 {
        self.flags.stop_signal.load(Ordering::SeqCst)
    }

    /// Read end of the wake pipe, when armed
    pub fn wake_fd(&self) -> Option<RawFd> {
        let fd = self.flags.wake_read.load(Ordering::SeqCst);
        (fd >= 0).then_some(fd)
    }

    /// Discard pending wake bytes. Call before `take_events`.
    pub fn drain_wake(&self) {
        let fd = match self.wake_fd() {
            Some(fd) => fd,
            None => return,
        };
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: reading into a local buffer of the stated length.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Drain pending events. Terminate stays latched and is reported on every call.
    pub fn take_events(&self) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        if self.flags.child_exited.swap(0, Ordering::SeqCst) > 0 {
            events.push(LifecycleEvent::ChildExited);
        }
        if self.flags.reload.swap(0, Ordering::SeqCst) > 0 {
            events.push(LifecycleEvent::ReloadConfig);
        }
        if self.flags.reload_dispatcher.swap(0, Ordering::SeqCst) > 0 {
            events.push(LifecycleEvent::ReloadDispatcher);
        }
        if self.terminate_requested() {
            events.push(LifecycleEvent::Terminate);
        }
        events
    }

    /// Sleep up to `timeout`, waking early on a terminate request.
    /// Returns true if termination was requested.
    pub fn wait_for_terminate(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.terminate_requested() {
                return true;
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            std::thread::sleep(remaining.min(Duration::from_millis(50)));
        }
        self.terminate_requested()
    }
}

/// Block lifecycle signals for a critical section (fork)
/// Returns guard that will unblock on drop
pub struct SignalBlockGuard {
    previous: SigSet,
}

impl SignalBlockGuard {
    pub fn block() -> Result<Self> {
        let mut mask = SigSet::empty();
        for sig in LIFECYCLE_SIGNALS {
            mask.add(sig);
        }

        let mut previous = SigSet::empty();
        signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&mask), Some(&mut previous))
            .map_err(|e| DaemonError::Signal(format!("Failed to block signals: {}", e)))?;

        Ok(Self { previous })
    }
}

impl Drop for SignalBlockGuard {
    fn drop(&mut self) {
        // Restores the exact pre-block mask; async-signal-safe, usable in a forked child.
        let _ = signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

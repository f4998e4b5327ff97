/// Daemon control loop
///
/// One parameterized state machine serves all three process roles. Each cycle
/// establishes the role's endpoints, hands control to the host's protocol
/// loop, and on a transport-level return tears everything down and rebuilds
/// it. Initialization failures are fatal; only `terminated` ends the loop
/// cleanly.
use crate::config::types::{DaemonError, Result, RestartPolicy, ServiceAccount};
use crate::core::host::ManagementHost;
use crate::core::state::{ServerRuntimeState, StopReport};
use crate::exec::launcher::{launch_engine, LaunchRequest};
use crate::exec::permissions::GrantPlan;
use crate::kernel::signal::{LifecycleEvent, SignalController};
use crate::safety::ownership::{OwnershipLedger, OwnershipOps, RevertReport, SystemOwnership};
use crate::transport::mux::{
    listen_on_named_socket, listen_on_stream_endpoint, wait_ready_with_wake, MuxStatus, SLOT_NAMED,
    SLOT_PAIR,
};
use crate::utils::random::SecretToken;
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL when stopping the engine
pub const ENGINE_STOP_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopRole {
    /// Root server serving the client socket itself
    Standalone,
    /// Root server that delegates serving to an unprivileged engine
    Supervisor,
    /// Unprivileged engine attached to its server over the pair channel
    Engine,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Listening,
    Serving,
    Restarting,
    ShuttingDown,
}

pub struct SupervisorConfig {
    pub engine_binary: PathBuf,
    /// Server arguments without the program name
    pub server_args: Vec<String>,
    /// Server's own secret-guarded socket, rebuilt every cycle
    pub engine_socket_path: PathBuf,
    /// Client-facing socket the engine is told to bind
    pub client_socket_file: PathBuf,
    pub account: ServiceAccount,
    pub grants: GrantPlan,
}

pub struct EngineConfig {
    pub channel: UnixStream,
    pub secret: Option<SecretToken>,
    pub bootstrap_timeout: Duration,
}

pub enum RoleConfig {
    Standalone { socket_file: PathBuf },
    Supervisor(SupervisorConfig),
    Engine(EngineConfig),
}

impl RoleConfig {
    pub fn role(&self) -> LoopRole {
        match self {
            RoleConfig::Standalone { .. } => LoopRole::Standalone,
            RoleConfig::Supervisor(_) => LoopRole::Supervisor,
            RoleConfig::Engine(_) => LoopRole::Engine,
        }
    }
}

/// What the host's protocol loop hands back to the control loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServeExit {
    Terminated,
    /// Rebuild the transport and serve again
    Restart(String),
}

/// Borrowed view of the loop handed to `ManagementHost::run_protocol`
pub struct ServeContext<'a> {
    pub state: &'a mut ServerRuntimeState,
    pub signals: &'a SignalController,
    pub role: LoopRole,
    pub poll_interval: Duration,
}

/// Default protocol-serving loop: apply lifecycle events, wait for readiness,
/// feed payloads to the host.
///
/// A supervisor forwards reload signals to its engine after reloading itself.
pub fn run_protocol<H: ManagementHost + ?Sized>(
    host: &mut H,
    ctx: &mut ServeContext<'_>,
) -> Result<ServeExit> {
    let wake = ctx.signals.wake_fd();
    loop {
        ctx.signals.drain_wake();
        for event in ctx.signals.take_events() {
            match event {
                LifecycleEvent::ChildExited => {
                    if let Some(exit) = ctx.state.reap_engine() {
                        if ctx.role == LoopRole::Supervisor {
                            return Ok(ServeExit::Restart(format!("engine {}", exit.describe())));
                        }
                    }
                }
                LifecycleEvent::ReloadConfig => {
                    if let Err(e) = host.reload_config() {
                        warn!("Configuration reload failed: {}", e);
                    }
                    if ctx.role == LoopRole::Supervisor {
                        ctx.state.signal_engine(Signal::SIGHUP);
                    }
                }
                LifecycleEvent::ReloadDispatcher => {
                    if let Err(e) = host.reload_dispatcher() {
                        warn!("Dispatcher reload failed: {}", e);
                    }
                    if ctx.role == LoopRole::Supervisor {
                        ctx.state.signal_engine(Signal::SIGUSR1);
                    }
                }
                LifecycleEvent::Terminate => {
                    ctx.state.observe_signals(ctx.signals);
                    return Ok(ServeExit::Terminated);
                }
            }
        }

        let ready = match wait_ready_with_wake(&ctx.state.mux, wake, ctx.poll_interval) {
            Ok(Some(ready)) => ready,
            Ok(None) => continue,
            Err(e) if e.is_restartable() => return Ok(ServeExit::Restart(e.to_string())),
            Err(e) => return Err(e),
        };

        for slot in [SLOT_NAMED, SLOT_PAIR] {
            let status = ctx.state.mux[slot]
                .dispatch(&ready, &mut |payload: &[u8]| host.handle_message(slot, payload));
            match status {
                Ok(MuxStatus::Open) => {}
                Ok(MuxStatus::PeerClosed) => {
                    if ctx.role == LoopRole::Engine {
                        info!("Server closed the channel; engine shutting down");
                        ctx.signals.raise(LifecycleEvent::Terminate);
                        ctx.state.observe_signals(ctx.signals);
                        return Ok(ServeExit::Terminated);
                    }
                    return Ok(ServeExit::Restart("engine channel closed".into()));
                }
                Err(e) if e.is_restartable() => return Ok(ServeExit::Restart(e.to_string())),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Summary returned once the loop has shut down
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub cycles: u64,
    pub restarts: u64,
    pub engine_stop: Option<StopReport>,
    pub revert: Option<RevertReport>,
    /// Signal that ended the loop (0 when it ended otherwise)
    pub stop_signal: i32,
}

pub struct DaemonControlLoop<H: ManagementHost, O: OwnershipOps = SystemOwnership> {
    role: RoleConfig,
    host: H,
    signals: SignalController,
    ledger: OwnershipLedger<O>,
    restart: RestartPolicy,
    poll_interval: Duration,
    as_root: bool,
    state: ServerRuntimeState,
    loop_state: LoopState,
}

impl<H: ManagementHost> DaemonControlLoop<H, SystemOwnership> {
    pub fn new(role: RoleConfig, host: H, signals: SignalController) -> Self {
        Self {
            role,
            host,
            signals,
            ledger: OwnershipLedger::new(),
            restart: RestartPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            as_root: crate::kernel::credentials::is_root(),
            state: ServerRuntimeState::new(),
            loop_state: LoopState::Initializing,
        }
    }
}

impl<H: ManagementHost, O: OwnershipOps> DaemonControlLoop<H, O> {
    pub fn with_ledger<P: OwnershipOps>(self, ledger: OwnershipLedger<P>) -> DaemonControlLoop<H, P> {
        DaemonControlLoop {
            role: self.role,
            host: self.host,
            signals: self.signals,
            ledger,
            restart: self.restart,
            poll_interval: self.poll_interval,
            as_root: self.as_root,
            state: self.state,
            loop_state: self.loop_state,
        }
    }

    pub fn with_restart_policy(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override root detection (revert gating).
    pub fn with_root(mut self, as_root: bool) -> Self {
        self.as_root = as_root;
        self
    }

    pub fn role(&self) -> LoopRole {
        self.role.role()
    }

    pub fn loop_state(&self) -> LoopState {
        self.loop_state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn enter(&mut self, next: LoopState) {
        if self.loop_state != next {
            debug!("Control loop: {:?} -> {:?}", self.loop_state, next);
            self.loop_state = next;
        }
    }

    /// Cycle until terminated, then clean up. A fatal error still runs cleanup
    /// before it is returned.
    pub fn run(mut self) -> Result<ShutdownReport> {
        info!(
            "Control loop starting as {:?} (incarnation {})",
            self.role(),
            self.state.incarnation()
        );
        let outcome = self.cycle();
        if let Err(e) = &outcome {
            error!("Control loop failed: {}", e);
        }
        let report = self.shutdown(outcome.as_ref().copied().unwrap_or_default());
        outcome.map(|_| report)
    }

    /// Returns the number of restarts performed.
    fn cycle(&mut self) -> Result<u64> {
        let mut restarts = 0u64;
        let mut consecutive = 0u32;

        while !self.state.observe_signals(&self.signals) {
            let cycle = self.state.begin_cycle();
            self.enter(LoopState::Initializing);

            // The supervisor keeps its network stack across engine relaunches.
            if self.role() != LoopRole::Supervisor || cycle == 1 {
                self.host.initialize_network()?;
                self.host.listen_wsman()?;
            }

            self.enter(LoopState::Listening);
            self.establish()?;

            self.enter(LoopState::Serving);
            let started = Instant::now();
            let exit = {
                let mut ctx = ServeContext {
                    state: &mut self.state,
                    signals: &self.signals,
                    role: self.role.role(),
                    poll_interval: self.poll_interval,
                };
                self.host.run_protocol(&mut ctx)?
            };

            let reason = match exit {
                ServeExit::Terminated => break,
                ServeExit::Restart(reason) => reason,
            };
            if self.state.observe_signals(&self.signals) {
                break;
            }

            self.enter(LoopState::Restarting);
            if let Some(policy) = self.host.restart_policy() {
                self.restart = policy;
            }
            if started.elapsed() >= self.restart.healthy_after() {
                consecutive = 0;
            }
            consecutive += 1;
            restarts += 1;
            if let Some(max) = self.restart.max_consecutive {
                if consecutive > max {
                    return Err(DaemonError::Process(format!(
                        "giving up after {} consecutive restarts: {}",
                        max, reason
                    )));
                }
            }

            let delay = self.restart.backoff_for(consecutive);
            warn!(
                "Cycle {} ended: {}; rebuilding transport in {:?}",
                cycle, reason, delay
            );
            if self.signals.wait_for_terminate(delay) {
                break;
            }
        }

        Ok(restarts)
    }

    fn establish(&mut self) -> Result<()> {
        match &self.role {
            RoleConfig::Standalone { socket_file } => {
                listen_on_named_socket(&mut self.state.mux[SLOT_NAMED], socket_file, None)?;
            }
            RoleConfig::Supervisor(cfg) => {
                self.state.stop_engine(ENGINE_STOP_GRACE);
                self.state.teardown_transport();
                let secret = SecretToken::generate();
                let request = LaunchRequest {
                    engine_binary: &cfg.engine_binary,
                    server_args: &cfg.server_args,
                    engine_socket_path: &cfg.engine_socket_path,
                    client_socket_file: &cfg.client_socket_file,
                    secret: &secret,
                    account: &cfg.account,
                };
                launch_engine(&mut self.state, &mut self.ledger, &cfg.grants, &request)?;
            }
            RoleConfig::Engine(cfg) => {
                let channel = cfg.channel.try_clone()?;
                let handle =
                    listen_on_stream_endpoint(&mut self.state.mux[SLOT_PAIR], channel, None, None)?;
                if let Some(secret) = &cfg.secret {
                    handle.present_secret(secret, cfg.bootstrap_timeout)?;
                }
                let info = handle.request_socket_file(cfg.bootstrap_timeout)?;
                debug!(
                    "Server socket {}, client socket {}",
                    info.server_socket.display(),
                    info.socket_file.display()
                );
                listen_on_named_socket(&mut self.state.mux[SLOT_NAMED], &info.socket_file, None)?;
            }
        }
        Ok(())
    }

    fn shutdown(mut self, restarts: u64) -> ShutdownReport {
        self.enter(LoopState::ShuttingDown);

        let engine_stop = self
            .state
            .engine_pid
            .is_some()
            .then(|| self.state.stop_engine(ENGINE_STOP_GRACE));
        self.state.teardown_transport();

        let revert = if self.as_root && self.role() == LoopRole::Supervisor && !self.ledger.is_empty() {
            let report = self.ledger.revert();
            if report.is_clean() {
                info!("Reverted ownership of {} path(s)", report.reverted.len());
            } else {
                warn!(
                    "Ownership revert left {} path(s) unchanged",
                    report.failed.len()
                );
            }
            Some(report)
        } else {
            None
        };

        let report = ShutdownReport {
            cycles: self.state.cycles(),
            restarts,
            engine_stop,
            revert,
            stop_signal: self.signals.stop_signal(),
        };
        info!(
            "Control loop stopped after {} cycle(s), {} restart(s)",
            report.cycles, report.restarts
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::LoggingHost;
    use crate::kernel::credentials::is_root;
    use crate::kernel::signal::SignalFlags;
    use crate::safety::ownership::tests::FakeOwnership;
    use crate::transport::mux::wait_ready;
    use crate::transport::protocol::BootstrapInfo;
    use crate::utils::random::SECRET_LEN;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::process::Command;

    fn fresh_signals() -> SignalController {
        SignalController::detached(Box::leak(Box::new(SignalFlags::new())))
    }

    fn quick_restarts() -> RestartPolicy {
        RestartPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            healthy_after_ms: 60_000,
            max_consecutive: None,
        }
    }

    fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    /// Account the /bin/sh engine stand-in runs as
    fn engine_account() -> ServiceAccount {
        if is_root() {
            let nobody = nix::unistd::User::from_name("nobody")
                .unwrap()
                .expect("nobody account");
            ServiceAccount {
                name: "nobody".into(),
                uid: nobody.uid.as_raw(),
                gid: nobody.gid.as_raw(),
            }
        } else {
            let gid = nix::unistd::getgid().as_raw();
            ServiceAccount {
                name: "self".into(),
                uid: nix::unistd::getuid().as_raw(),
                gid: if gid == 0 { 65534 } else { gid },
            }
        }
    }

    /// Fails its first `failures` protocol runs, then asks to terminate
    struct FlakyHost {
        socket: PathBuf,
        failures: u32,
        runs: u32,
        socket_seen: Vec<bool>,
        network_inits: u32,
        reloaded_policy: Option<RestartPolicy>,
    }

    impl FlakyHost {
        fn new(socket: &Path, failures: u32) -> Self {
            Self {
                socket: socket.to_path_buf(),
                failures,
                runs: 0,
                socket_seen: Vec::new(),
                network_inits: 0,
                reloaded_policy: None,
            }
        }
    }

    impl ManagementHost for FlakyHost {
        fn initialize_network(&mut self) -> Result<()> {
            self.network_inits += 1;
            Ok(())
        }

        fn restart_policy(&self) -> Option<RestartPolicy> {
            self.reloaded_policy.clone()
        }

        fn run_protocol(&mut self, ctx: &mut ServeContext<'_>) -> Result<ServeExit> {
            self.runs += 1;
            self.socket_seen.push(self.socket.exists());
            if self.runs <= self.failures {
                return Ok(ServeExit::Restart("transient".into()));
            }
            ctx.signals.raise(LifecycleEvent::Terminate);
            run_protocol(self, ctx)
        }
    }

    #[test]
    fn transient_failure_rebuilds_transport() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cimd.socket");
        let signals = fresh_signals();

        let report = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: socket.clone(),
            },
            FlakyHost::new(&socket, 1),
            signals,
        )
        .with_restart_policy(quick_restarts())
        .with_poll_interval(Duration::from_millis(10))
        .run()
        .unwrap();

        assert_eq!(report.cycles, 2);
        assert_eq!(report.restarts, 1);
        assert!(report.revert.is_none());
        assert!(!socket.exists());
    }

    #[test]
    fn every_cycle_sees_a_live_socket_and_fresh_network() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cimd.socket");
        let mut control = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: socket.clone(),
            },
            FlakyHost::new(&socket, 2),
            fresh_signals(),
        )
        .with_restart_policy(quick_restarts());

        // Drive the cycle directly so the host stays inspectable.
        assert_eq!(control.cycle().unwrap(), 2);
        assert_eq!(control.host().socket_seen, vec![true, true, true]);
        assert_eq!(control.host().network_inits, 3);
        assert_eq!(control.loop_state(), LoopState::Serving);
    }

    #[test]
    fn terminate_before_start_runs_no_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let signals = fresh_signals();
        signals.raise(LifecycleEvent::Terminate);

        let report = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: dir.path().join("cimd.socket"),
            },
            FlakyHost::new(&dir.path().join("cimd.socket"), 0),
            signals,
        )
        .run()
        .unwrap();
        assert_eq!(report.cycles, 0);
    }

    #[test]
    fn restart_ceiling_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cimd.socket");
        let policy = RestartPolicy {
            max_consecutive: Some(2),
            ..quick_restarts()
        };

        let err = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: socket.clone(),
            },
            FlakyHost::new(&socket, u32::MAX),
            fresh_signals(),
        )
        .with_restart_policy(policy)
        .run()
        .unwrap_err();

        assert!(matches!(err, DaemonError::Process(_)));
        assert!(!socket.exists());
    }

    #[test]
    fn reloaded_restart_policy_applies_on_next_restart() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cimd.socket");
        let mut host = FlakyHost::new(&socket, u32::MAX);
        host.reloaded_policy = Some(RestartPolicy {
            max_consecutive: Some(1),
            ..quick_restarts()
        });

        // The starting policy retries forever; only the reloaded one stops it.
        let err = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: socket.clone(),
            },
            host,
            fresh_signals(),
        )
        .with_restart_policy(quick_restarts())
        .run()
        .unwrap_err();
        assert!(matches!(err, DaemonError::Process(_)));
    }

    #[test]
    fn bind_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("missing").join("cimd.socket");
        let result = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: socket.clone(),
            },
            FlakyHost::new(&socket, 0),
            fresh_signals(),
        )
        .run();
        assert!(result.is_err());
    }

    #[test]
    fn revert_is_skipped_outside_supervisor_role() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cimd.socket");
        let owned = dir.path().join("owned");
        std::fs::write(&owned, b"").unwrap();
        let fake = FakeOwnership::with(&[(owned.to_str().unwrap(), 0, 0)]);
        let mut ledger = OwnershipLedger::with_ops(fake.clone());
        let account = ServiceAccount {
            name: "svc".into(),
            uid: 4242,
            gid: 4242,
        };
        ledger.grant(&owned, &account).unwrap();

        let report = DaemonControlLoop::new(
            RoleConfig::Standalone {
                socket_file: socket.clone(),
            },
            FlakyHost::new(&socket, 0),
            fresh_signals(),
        )
        .with_ledger(ledger)
        .with_root(true)
        .run()
        .unwrap();

        assert!(report.revert.is_none());
        assert_eq!(fake.owner_of(owned.to_str().unwrap()), (4242, 4242));
    }

    /// Engine role against an in-process server end of the pair
    #[test]
    fn engine_bootstraps_from_its_server() {
        let dir = tempfile::tempdir().unwrap();
        let client_socket = dir.path().join("client.sock");
        let server_socket = dir.path().join("cimd_engine");
        let (server_end, engine_end) = UnixStream::pair().unwrap();
        let secret = SecretToken::generate();
        let engine_secret = secret.clone();

        let info = BootstrapInfo {
            socket_file: client_socket.clone(),
            server_socket: server_socket.clone(),
        };
        let server = std::thread::spawn(move || {
            let mut muxes = [
                crate::transport::mux::Multiplexer::new(SLOT_NAMED),
                crate::transport::mux::Multiplexer::new(SLOT_PAIR),
            ];
            listen_on_stream_endpoint(&mut muxes[SLOT_PAIR], server_end, Some(info), Some(secret))
                .unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                if let Some(ready) = wait_ready(&muxes, Duration::from_millis(50)).unwrap() {
                    let status = muxes[SLOT_PAIR]
                        .dispatch(&ready, &mut |_: &[u8]| None)
                        .unwrap();
                    if status == MuxStatus::PeerClosed {
                        return true;
                    }
                }
            }
            false
        });

        struct SocketCheck {
            socket: PathBuf,
            bound: bool,
        }
        impl ManagementHost for SocketCheck {
            fn run_protocol(&mut self, ctx: &mut ServeContext<'_>) -> Result<ServeExit> {
                self.bound = self.socket.exists();
                ctx.signals.raise(LifecycleEvent::Terminate);
                Ok(ServeExit::Terminated)
            }
        }

        let mut control = DaemonControlLoop::new(
            RoleConfig::Engine(EngineConfig {
                channel: engine_end,
                secret: Some(engine_secret),
                bootstrap_timeout: Duration::from_secs(5),
            }),
            SocketCheck {
                socket: client_socket.clone(),
                bound: false,
            },
            fresh_signals(),
        );
        control.cycle().unwrap();
        assert!(control.host().bound);

        let report = control.shutdown(0);
        assert_eq!(report.cycles, 1);
        assert!(!client_socket.exists());
        assert!(server.join().unwrap());
    }

    #[test]
    fn supervisor_forwards_reloads_to_engine() {
        let dir = tempfile::tempdir().unwrap();
        let ready = dir.path().join("ready");
        let seen = dir.path().join("seen");
        let script = format!(
            "trap 'echo hup >> {seen}' HUP\ntrap 'echo usr1 >> {seen}' USR1\ntouch {ready}\nwhile :; do sleep 1; done\n",
            seen = seen.display(),
            ready = ready.display()
        );
        let child = Command::new("/bin/sh").arg("-c").arg(script).spawn().unwrap();
        assert!(wait_until(Duration::from_secs(10), || ready.exists()));

        let signals = fresh_signals();
        let mut state = ServerRuntimeState::new();
        state.engine_pid = Some(nix::unistd::Pid::from_raw(child.id() as i32));
        signals.raise(LifecycleEvent::ReloadConfig);
        signals.raise(LifecycleEvent::ReloadDispatcher);
        signals.raise(LifecycleEvent::Terminate);

        let mut host = LoggingHost::default();
        let exit = run_protocol(
            &mut host,
            &mut ServeContext {
                state: &mut state,
                signals: &signals,
                role: LoopRole::Supervisor,
                poll_interval: Duration::from_millis(10),
            },
        )
        .unwrap();
        assert_eq!(exit, ServeExit::Terminated);
        assert_eq!((host.reloads, host.dispatcher_reloads), (1, 1));

        let forwarded = wait_until(Duration::from_secs(10), || {
            let text = std::fs::read_to_string(&seen).unwrap_or_default();
            text.contains("hup") && text.contains("usr1")
        });
        state.stop_engine(Duration::from_secs(5));
        assert!(forwarded, "reload signals never reached the engine");
    }

    #[test]
    fn raised_signal_wakes_an_idle_protocol_loop() {
        let flags: &'static SignalFlags = Box::leak(Box::new(SignalFlags::new()));
        flags.arm_wake_pipe().unwrap();
        let signals = SignalController::detached(flags);

        let dir = tempfile::tempdir().unwrap();
        let mut state = ServerRuntimeState::new();
        listen_on_named_socket(
            &mut state.mux[SLOT_NAMED],
            &dir.path().join("cimd.socket"),
            None,
        )
        .unwrap();

        let raiser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            signals.raise(LifecycleEvent::Terminate);
        });

        let start = Instant::now();
        let exit = run_protocol(
            &mut LoggingHost::default(),
            &mut ServeContext {
                state: &mut state,
                signals: &signals,
                role: LoopRole::Standalone,
                poll_interval: Duration::from_secs(60),
            },
        )
        .unwrap();
        assert_eq!(exit, ServeExit::Terminated);
        assert!(start.elapsed() < Duration::from_secs(10));
        raiser.join().unwrap();
    }

    /// Lets the first engine die, terminates once the relaunched one reported
    struct RelaunchWatch {
        launches: PathBuf,
        runs: u32,
    }

    impl RelaunchWatch {
        fn launch_count(&self) -> usize {
            std::fs::read_to_string(&self.launches)
                .map(|text| text.lines().count())
                .unwrap_or(0)
        }
    }

    impl ManagementHost for RelaunchWatch {
        fn run_protocol(&mut self, ctx: &mut ServeContext<'_>) -> Result<ServeExit> {
            self.runs += 1;
            if self.runs >= 2 {
                let deadline = Instant::now() + Duration::from_secs(10);
                while self.launch_count() < 2 && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(20));
                }
                ctx.signals.raise(LifecycleEvent::Terminate);
            }
            run_protocol(self, ctx)
        }
    }

    #[test]
    fn supervisor_relaunches_dead_engine_and_reverts_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).unwrap();
        let launches = dir.path().join("launches");
        let engine_socket = dir.path().join("cimd_engine");
        let account = engine_account();

        // First launch exits at once (closing the pair); the second stays up.
        let script = format!(
            "echo \"$CIMD_HANDOFF_SECRET\" >> {log}\nn=$(wc -l < {log})\nif [ $n -ge 2 ]; then exec sleep 30; fi\n",
            log = launches.display()
        );

        let owned = dir.path().join("owned");
        std::fs::write(&owned, b"").unwrap();
        let fake = FakeOwnership::with(&[(owned.to_str().unwrap(), 0, 0)]);
        let mut ledger = OwnershipLedger::with_ops(fake.clone());
        ledger.grant(&owned, &account).unwrap();

        let report = DaemonControlLoop::new(
            RoleConfig::Supervisor(SupervisorConfig {
                engine_binary: PathBuf::from("/bin/sh"),
                server_args: vec!["-c".into(), script, "cimengine".into()],
                engine_socket_path: engine_socket.clone(),
                client_socket_file: dir.path().join("cimd.socket"),
                account: account.clone(),
                grants: GrantPlan::default(),
            }),
            RelaunchWatch {
                launches: launches.clone(),
                runs: 0,
            },
            fresh_signals(),
        )
        .with_ledger(ledger)
        .with_root(true)
        .with_restart_policy(quick_restarts())
        .with_poll_interval(Duration::from_millis(10))
        .run()
        .unwrap();

        assert_eq!(report.cycles, 2);
        assert_eq!(report.restarts, 1);

        let text = std::fs::read_to_string(&launches).unwrap();
        let secrets: Vec<&str> = text.lines().collect();
        assert_eq!(secrets.len(), 2);
        assert!(secrets.iter().all(|s| s.len() == SECRET_LEN));
        assert_ne!(secrets[0], secrets[1], "each launch needs a fresh secret");

        let stop = report.engine_stop.expect("relaunched engine was stopped");
        assert!(stop.exit.is_some());

        let revert = report.revert.expect("supervisor running as root reverts");
        assert!(revert.is_clean());
        assert_eq!(fake.owner_of(owned.to_str().unwrap()), (0, 0));
        assert!(!engine_socket.exists());
    }
}

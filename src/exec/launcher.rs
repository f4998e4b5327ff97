/// Privilege-separation launcher
///
/// Grants the engine its paths, binds the server's secret-guarded engine
/// socket, creates the non-blocking pair, forks, and in the child drops to the
/// service account and execs the engine with only the pair end inherited.
use crate::config::types::{DaemonError, Result, ServiceAccount};
use crate::core::state::ServerRuntimeState;
use crate::exec::handoff::{engine_argv, ChannelHandoff};
use crate::exec::permissions::GrantPlan;
use crate::exec::preexec::{run_engine_child, ExecImage};
use crate::kernel::credentials::is_root;
use crate::kernel::signal::SignalBlockGuard;
use crate::observability::audit;
use crate::safety::ownership::{OwnershipLedger, OwnershipOps};
use crate::transport::mux::{listen_on_named_socket, listen_on_stream_endpoint, SLOT_NAMED, SLOT_PAIR};
use crate::transport::protocol::BootstrapInfo;
use crate::utils::env_hygiene::{engine_environment, to_envp};
use crate::utils::random::SecretToken;
use log::info;
use nix::unistd::{fork, ForkResult, Pid};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Everything one launch needs
pub struct LaunchRequest<'a> {
    pub engine_binary: &'a Path,
    /// Server arguments without the program name
    pub server_args: &'a [String],
    /// Server's engine-facing socket, guarded by `secret`
    pub engine_socket_path: &'a Path,
    /// Client-facing socket the engine will bind
    pub client_socket_file: &'a Path,
    pub secret: &'a SecretToken,
    pub account: &'a ServiceAccount,
}

/// Running engine, as seen from the server
#[derive(Clone, Debug)]
pub struct EngineHandle {
    pub pid: Pid,
    pub binary: PathBuf,
    pub engine_socket_path: PathBuf,
}

/// Launch the engine. On return the parent's pair end is live in slot 1 and
/// `state.engine_pid` is set.
pub fn launch_engine<O: OwnershipOps>(
    state: &mut ServerRuntimeState,
    ledger: &mut OwnershipLedger<O>,
    grants: &GrantPlan,
    request: &LaunchRequest<'_>,
) -> Result<EngineHandle> {
    request.account.validate()?;
    let as_root = is_root();

    grants.apply(ledger, request.account, as_root)?;

    listen_on_named_socket(
        &mut state.mux[SLOT_NAMED],
        request.engine_socket_path,
        Some(request.secret.clone()),
    )?;

    let (parent_end, child_end) = UnixStream::pair()
        .map_err(|e| DaemonError::Process(format!("failed to create socket pair: {}", e)))?;
    for end in [&parent_end, &child_end] {
        end.set_nonblocking(true).map_err(|e| {
            DaemonError::Process(format!("failed to set socket pair non-blocking: {}", e))
        })?;
    }

    let child_fd = child_end.as_raw_fd();
    let handoff = ChannelHandoff::new(child_fd, Some(request.secret.clone()));
    let argv = engine_argv(
        &request.engine_binary.to_string_lossy(),
        request.server_args,
        &handoff,
    );
    let extra: Vec<(&str, &str)> = handoff.env().into_iter().collect();
    let image = ExecImage::prepare(request.engine_binary, &argv, to_envp(&engine_environment(&extra)))?;
    let target = as_root.then_some((request.account.uid, request.account.gid));

    let guard = SignalBlockGuard::block()?;
    // SAFETY: the child only runs the pre-exec chain, which ends in exec or _exit.
    let forked = unsafe { fork() };
    match forked {
        Ok(ForkResult::Child) => {
            drop(parent_end);
            drop(guard);
            run_engine_child(child_fd, target, &image)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(guard);
            drop(child_end);
            state.engine_pid = Some(child);

            listen_on_stream_endpoint(
                &mut state.mux[SLOT_PAIR],
                parent_end,
                Some(BootstrapInfo {
                    socket_file: request.client_socket_file.to_path_buf(),
                    server_socket: request.engine_socket_path.to_path_buf(),
                }),
                Some(request.secret.clone()),
            )?;

            info!(
                "Started engine {} (pid {}) as {}",
                request.engine_binary.display(),
                child,
                request.account.name
            );
            audit::engine_launched(child.as_raw(), request.engine_binary, &request.account.name);

            Ok(EngineHandle {
                pid: child,
                binary: request.engine_binary.to_path_buf(),
                engine_socket_path: request.engine_socket_path.to_path_buf(),
            })
        }
        Err(e) => {
            drop(guard);
            Err(DaemonError::Process(format!("failed to fork engine: {}", e)))
        }
    }
}

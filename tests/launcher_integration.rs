//! Engine launch through fork/exec with /bin/sh standing in for the engine
//!
//! The shell records what it inherited (channel fd, a leak canary, the handoff
//! secret, its uid) into a file the test reads back.

use cimd::config::types::ServiceAccount;
use cimd::core::state::{EngineExit, ServerRuntimeState};
use cimd::exec::launcher::{launch_engine, LaunchRequest};
use cimd::exec::permissions::GrantPlan;
use cimd::kernel::credentials::is_root;
use cimd::safety::ownership::OwnershipLedger;
use cimd::transport::mux::{SLOT_NAMED, SLOT_PAIR};
use cimd::utils::random::{SecretToken, SECRET_LEN};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Non-CLOEXEC descriptor the child must not inherit
const CANARY_FLOOR: libc::c_int = 60;

fn test_account() -> ServiceAccount {
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

fn engine_script(out: &Path, canary: libc::c_int) -> String {
    format!(
        r#"fd=$2
if [ -e /proc/$$/fd/$fd ]; then chan=yes; else chan=no; fi
if [ -e /proc/$$/fd/{canary} ]; then leak=yes; else leak=no; fi
len=${{#CIMD_HANDOFF_SECRET}}
uid=$(id -u)
echo "$1 $chan $leak $len $uid" > {out}.tmp && mv {out}.tmp {out}
"#,
        canary = canary,
        out = out.display()
    )
}

fn wait_for_file(path: &Path) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(content) = std::fs::read_to_string(path) {
            return content;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("engine never wrote {}", path.display());
}

#[test]
fn engine_inherits_only_its_channel() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777)).unwrap();
    let out = dir.path().join("engine.out");
    let engine_socket = dir.path().join("cimd_engine");
    let account = test_account();

    // SAFETY: plain descriptor duplication of stderr.
    let canary = unsafe { libc::fcntl(2, libc::F_DUPFD, CANARY_FLOOR) };
    assert!(canary >= CANARY_FLOOR);

    let server_args = vec![
        "-c".to_string(),
        engine_script(&out, canary),
        "cimengine".to_string(),
        "--nonroot".to_string(),
    ];
    let secret = SecretToken::generate();
    let mut state = ServerRuntimeState::new();
    let mut ledger = OwnershipLedger::new();

    let handle = launch_engine(
        &mut state,
        &mut ledger,
        &GrantPlan::default(),
        &LaunchRequest {
            engine_binary: Path::new("/bin/sh"),
            server_args: &server_args,
            engine_socket_path: &engine_socket,
            client_socket_file: &dir.path().join("cimd.socket"),
            secret: &secret,
            account: &account,
        },
    )
    .unwrap();
    // SAFETY: closing the descriptor duplicated above.
    unsafe { libc::close(canary) };

    assert_eq!(state.engine_pid, Some(handle.pid));
    assert!(state.mux[SLOT_NAMED].is_active());
    assert!(state.mux[SLOT_PAIR].is_active());
    assert!(engine_socket.exists());
    assert!(ledger.is_empty());

    let report = wait_for_file(&out);
    let fields: Vec<&str> = report.split_whitespace().collect();
    // --nonroot is stripped, so $1 is the handoff flag.
    assert_eq!(fields[0], "--socketpair");
    assert_eq!(fields[1], "yes", "channel descriptor missing in engine");
    assert_eq!(fields[2], "no", "canary descriptor leaked into engine");
    assert_eq!(fields[3], SECRET_LEN.to_string());
    assert_eq!(fields[4], account.uid.to_string());

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut exit = None;
    while exit.is_none() && Instant::now() < deadline {
        exit = state.reap_engine();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(exit, Some(EngineExit::Exited(0)));

    state.teardown_transport();
    assert!(!engine_socket.exists());
}

#[test]
fn missing_engine_binary_exits_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let account = test_account();
    let secret = SecretToken::generate();
    let mut state = ServerRuntimeState::new();
    let mut ledger = OwnershipLedger::new();

    launch_engine(
        &mut state,
        &mut ledger,
        &GrantPlan::default(),
        &LaunchRequest {
            engine_binary: &dir.path().join("no-such-engine"),
            server_args: &[],
            engine_socket_path: &dir.path().join("cimd_engine"),
            client_socket_file: &dir.path().join("cimd.socket"),
            secret: &secret,
            account: &account,
        },
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut exit = None;
    while exit.is_none() && Instant::now() < deadline {
        exit = state.reap_engine();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(exit, Some(EngineExit::Exited(127)));
}

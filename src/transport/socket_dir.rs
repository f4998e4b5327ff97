/// Sockets directory for the server's engine-facing socket
///
/// Swept on every fresh non-root startup; a new randomly named socket file is
/// chosen afterwards, so a prior incarnation's file can never be reused.
use crate::config::types::{DaemonError, Result, ServiceAccount};
use crate::utils::random::socket_file_name;
use log::{debug, info};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Remove every entry of `dir`, or create it when absent.
///
/// A created directory is 0700 and owned by `account` when running as root,
/// 0755 otherwise. Returns the number of swept entries.
pub fn prepare_sockets_dir(
    dir: &Path,
    account: Option<&ServiceAccount>,
    as_root: bool,
) -> Result<usize> {
    if dir.is_dir() {
        return sweep(dir);
    }

    let mode = if as_root { 0o700 } else { 0o755 };
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(dir)
        .map_err(|e| {
            DaemonError::Config(format!(
                "failed to create sockets directory {}: {}",
                dir.display(),
                e
            ))
        })?;

    if as_root {
        if let Some(account) = account {
            nix::unistd::chown(
                dir,
                Some(nix::unistd::Uid::from_raw(account.uid)),
                Some(nix::unistd::Gid::from_raw(account.gid)),
            )
            .map_err(|e| {
                DaemonError::Privilege(format!(
                    "failed to chown sockets directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
    }

    info!("Created sockets directory {} ({:o})", dir.display(), mode);
    Ok(0)
}

fn sweep(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let outcome = if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        match outcome {
            Ok(()) => {
                debug!("Removed stale {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Sweep or create `dir`, then pick a fresh socket path inside it.
pub fn create_socket_file_path(
    dir: &Path,
    account: Option<&ServiceAccount>,
    as_root: bool,
) -> Result<PathBuf> {
    let swept = prepare_sockets_dir(dir, account, as_root)?;
    if swept > 0 {
        info!("Swept {} stale entries from {}", swept, dir.display());
    }
    Ok(dir.join(socket_file_name()))
}

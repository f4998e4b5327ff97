//! Credential validation logic.

use crate::config::types::{DaemonError, Result};

/// Reject root UIDs/GIDs (0) as a transition target.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(DaemonError::Privilege(format!(
            "Cannot transition engine to root UID/GID (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}

/// True when the effective uid is root.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

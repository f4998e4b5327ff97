//! UID/GID transition to the service account.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid. Every failure is
//! fatal to the caller: an engine must never continue with root credentials.

use super::validation::validate_ids;
use crate::config::types::{DaemonError, Result};

/// validate -> clear groups -> setresgid -> setresuid -> verify.
///
/// Runs in the forked engine child, so it neither logs nor allocates on the
/// success path.
pub fn transition_to_service_account(uid: u32, gid: u32) -> Result<()> {
    validate_ids(uid, gid)?;
    clear_supplementary_groups(gid)?;
    // CRITICAL: GID before UID
    set_gid(gid)?;
    set_uid(uid)?;
    verify_transition(uid, gid)
}

fn clear_supplementary_groups(gid: u32) -> Result<()> {
    // SAFETY: single-element list pointing at a valid gid_t.
    let groups = [gid as libc::gid_t];
    let rc = unsafe { libc::setgroups(1, groups.as_ptr()) };
    if rc != 0 {
        return Err(DaemonError::Privilege(format!(
            "Failed to reset supplementary groups: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// MUST be called BEFORE set_uid.
fn set_gid(gid: u32) -> Result<()> {
    // SAFETY: setresgid atomically sets all three GIDs. gid validated != 0 by caller.
    let rc = unsafe { libc::setresgid(gid, gid, gid) };
    if rc != 0 {
        return Err(DaemonError::Privilege(format!(
            "Failed to setresgid({}): {}",
            gid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// MUST be called AFTER set_gid.
fn set_uid(uid: u32) -> Result<()> {
    // SAFETY: setresuid atomically sets all three UIDs. uid validated != 0 by caller.
    let rc = unsafe { libc::setresuid(uid, uid, uid) };
    if rc != 0 {
        return Err(DaemonError::Privilege(format!(
            "Failed to setresuid({}): {}",
            uid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn verify_transition(expected_uid: u32, expected_gid: u32) -> Result<()> {
    use nix::unistd::{getegid, geteuid, getgid, getuid};

    let real_uid = getuid().as_raw();
    let effective_uid = geteuid().as_raw();
    let real_gid = getgid().as_raw();
    let effective_gid = getegid().as_raw();

    if real_uid != expected_uid || effective_uid != expected_uid {
        return Err(DaemonError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            expected_uid, real_uid, effective_uid
        )));
    }

    if real_gid != expected_gid || effective_gid != expected_gid {
        return Err(DaemonError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            expected_gid, real_gid, effective_gid
        )));
    }

    // Regaining root must be impossible after the drop.
    if unsafe { libc::setuid(0) } == 0 {
        return Err(DaemonError::Privilege(
            "setuid(0) succeeded after privilege drop".to_string(),
        ));
    }

    Ok(())
}

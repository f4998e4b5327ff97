//! Ownership transfer ledger.
//!
//! Every path whose owner is changed for the engine hand-off is recorded
//! with its original owner before the change, so shutdown can put it back.
//! Granting is idempotent: a path already owned by the service account is
//! left alone and never recorded twice.

use crate::config::types::{DaemonError, Result, ServiceAccount};
use crate::observability::audit;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// More than this many changed paths indicates a configuration anomaly
pub const OWNERSHIP_LEDGER_CAPACITY: usize = 24;

/// Original owner of a path we changed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipRecord {
    pub path: PathBuf,
    pub original_uid: u32,
    pub original_gid: u32,
}

/// Filesystem ownership primitives
pub trait OwnershipOps {
    /// Current (uid, gid), or None if the path does not exist
    fn owner(&self, path: &Path) -> Result<Option<(u32, u32)>>;
    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()>;
}

/// Real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOwnership;

impl OwnershipOps for SystemOwnership {
    fn owner(&self, path: &Path) -> Result<Option<(u32, u32)>> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Some((meta.uid(), meta.gid()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|e| DaemonError::Privilege(format!("failed to chown path {}: {}", path.display(), e)))
    }
}

/// Outcome of one grant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Owner changed and recorded
    Changed,
    /// Already owned by the service account
    Unchanged,
    /// Path does not exist
    Missing,
}

/// Result of reverting the ledger at shutdown
#[derive(Debug, Default)]
pub struct RevertReport {
    pub reverted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RevertReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Append-only list of ownership changes, drained once at shutdown
pub struct OwnershipLedger<O: OwnershipOps = SystemOwnership> {
    ops: O,
    records: Vec<OwnershipRecord>,
    capacity: usize,
}

impl OwnershipLedger<SystemOwnership> {
    pub fn new() -> Self {
        Self::with_ops(SystemOwnership)
    }
}

impl Default for OwnershipLedger<SystemOwnership> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: OwnershipOps> OwnershipLedger<O> {
    pub fn with_ops(ops: O) -> Self {
        Self {
            ops,
            records: Vec::new(),
            capacity: OWNERSHIP_LEDGER_CAPACITY,
        }
    }

    pub fn records(&self) -> &[OwnershipRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.records.iter().any(|r| r.path == path)
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    /// Hand `path` to the service account if it belongs to someone else.
    pub fn grant(&mut self, path: &Path, account: &ServiceAccount) -> Result<GrantOutcome> {
        let (uid, gid) = match self.ops.owner(path)? {
            Some(owner) => owner,
            None => return Ok(GrantOutcome::Missing),
        };

        if uid == account.uid && gid == account.gid {
            return Ok(GrantOutcome::Unchanged);
        }

        // Record before the change so a partial failure is still revertible.
        if !self.contains(path) {
            if self.records.len() >= self.capacity {
                return Err(DaemonError::OwnershipLedgerFull {
                    capacity: self.capacity,
                });
            }
            self.records.push(OwnershipRecord {
                path: path.to_path_buf(),
                original_uid: uid,
                original_gid: gid,
            });
        }

        self.ops.chown(path, account.uid, account.gid)?;
        audit::ownership_changed(path, (uid, gid), (account.uid, account.gid));
        log::info!("Changed ownership of {} to {}", path.display(), account.name);
        Ok(GrantOutcome::Changed)
    }

    /// Grant `path`, and for a file also the directory containing it.
    pub fn grant_path(
        &mut self,
        path: &Path,
        is_directory: bool,
        account: &ServiceAccount,
    ) -> Result<()> {
        self.grant(path, account)?;
        if !is_directory {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                self.grant(parent, account)?;
            }
        }
        Ok(())
    }

    /// Restore every recorded owner. Individual failures are reported, never fatal.
    pub fn revert(mut self) -> RevertReport {
        let mut report = RevertReport::default();
        let records = std::mem::take(&mut self.records);

        for record in records.into_iter().rev() {
            match self
                .ops
                .chown(&record.path, record.original_uid, record.original_gid)
            {
                Ok(()) => {
                    audit::ownership_reverted(&record.path, None);
                    report.reverted.push(record.path);
                }
                Err(e) => {
                    log::error!(
                        "Unable to change ownership back: {}: {}",
                        record.path.display(),
                        e
                    );
                    audit::ownership_reverted(&record.path, Some(&e.to_string()));
                    report.failed.push((record.path, e.to_string()));
                }
            }
        }

        report
    }
}

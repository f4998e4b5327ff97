/// Paths the unprivileged engine needs, handed over while still root
use crate::config::paths::PathResolver;
use crate::config::types::{Result, ServiceAccount};
use crate::safety::ownership::{OwnershipLedger, OwnershipOps};
use log::debug;
use std::path::{Path, PathBuf};

/// Per-user credential fallback, relative to `$HOME`
pub const HOME_NTLM_CRED: &str = ".omi/ntlmcred";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantTarget {
    pub path: PathBuf,
    /// Files also grant their containing directory
    pub is_directory: bool,
}

impl GrantTarget {
    fn dir(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            is_directory: true,
        }
    }

    fn file(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            is_directory: false,
        }
    }
}

/// Ordered list of grant targets for one launch
#[derive(Clone, Debug, Default)]
pub struct GrantPlan {
    targets: Vec<GrantTarget>,
}

impl GrantPlan {
    /// Client socket dir, key file, auth dir, state dir, then the optional
    /// NTLM credential files.
    pub fn for_engine(
        paths: &dyn PathResolver,
        ntlm_cred_file: Option<&Path>,
        ntlm_user_file: Option<&Path>,
        home: Option<&Path>,
    ) -> Self {
        let mut targets = Vec::new();
        if let Some(sock_dir) = paths.socket_file().parent() {
            targets.push(GrantTarget::dir(sock_dir));
        }
        targets.push(GrantTarget::file(paths.key_file()));
        targets.push(GrantTarget::dir(paths.auth_dir()));
        targets.push(GrantTarget::dir(paths.local_state_dir()));
        if let Some(cred) = ntlm_cred_file {
            targets.push(GrantTarget::file(cred));
        }
        if let Some(user_file) = ntlm_user_file {
            targets.push(GrantTarget::file(user_file));
        }
        if let Some(home) = home {
            targets.push(GrantTarget::file(&home.join(HOME_NTLM_CRED)));
        }
        Self { targets }
    }

    pub fn targets(&self) -> &[GrantTarget] {
        &self.targets
    }

    /// Hand every target to `account`. Nothing happens unless `as_root`.
    pub fn apply<O: OwnershipOps>(
        &self,
        ledger: &mut OwnershipLedger<O>,
        account: &ServiceAccount,
        as_root: bool,
    ) -> Result<()> {
        if !as_root {
            debug!("Not root; skipping engine permission grant");
            return Ok(());
        }
        account.validate()?;
        for target in &self.targets {
            ledger.grant_path(&target.path, target.is_directory, account)?;
        }
        Ok(())
    }
}

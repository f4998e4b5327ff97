/// Pass/fail contract for credential files used by the authentication layer
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Decides whether a credential file may be used
pub trait CredentialValidator {
    fn validate(&self, path: &Path) -> std::result::Result<(), String>;
}

/// Regular file, not accessible to group or others
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissionCheck;

impl CredentialValidator for PermissionCheck {
    fn validate(&self, path: &Path) -> std::result::Result<(), String> {
        let meta = std::fs::metadata(path).map_err(|e| format!("{}: {}", path.display(), e))?;
        if !meta.is_file() {
            return Err(format!("{} is not a regular file", path.display()));
        }
        if meta.mode() & 0o077 != 0 {
            return Err(format!(
                "{} is accessible to group or others (mode {:o})",
                path.display(),
                meta.mode() & 0o777
            ));
        }
        Ok(())
    }
}

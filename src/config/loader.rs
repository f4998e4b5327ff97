use crate::config::paths::DaemonPaths;
use crate::config::types::{DaemonError, RestartPolicy, Result};
/// Configuration loading from a JSON config file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Full config file structure; every key is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub paths: DaemonPaths,
    pub service_account: Option<String>,
    pub ntlm_cred_file: Option<PathBuf>,
    pub restart: RestartPolicy,
}

impl DaemonConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| DaemonError::Config(e.to_string()))
    }
}

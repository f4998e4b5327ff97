/// Environment hygiene for the server and the engine it launches
///
/// The server captures and scrubs `NTLM_USER_FILE` at startup so the path is
/// known to the ownership grant but never leaks into child environments.
/// The handoff secret is the only variable added to the engine environment.
use crate::observability::audit;
use std::collections::BTreeMap;
use std::env;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

/// Credential file variable honoured by the authentication layer
pub const NTLM_USER_FILE_VAR: &str = "NTLM_USER_FILE";

/// Loader variables never forwarded to the engine
const STRIPPED_VARS: [&str; 4] = ["LD_PRELOAD", "LD_AUDIT", "LD_DEBUG", "LD_PROFILE"];

/// Read `NTLM_USER_FILE`, then remove it from this process's environment.
pub fn take_ntlm_user_file() -> Option<PathBuf> {
    let value = env::var_os(NTLM_USER_FILE_VAR)?;
    env::remove_var(NTLM_USER_FILE_VAR);
    audit::ntlm_env_ignored(NTLM_USER_FILE_VAR);
    if value.is_empty() {
        return None;
    }
    Some(PathBuf::from(value))
}

/// Read `name`, then remove it from this process's environment.
pub fn take_var(name: &str) -> Option<String> {
    let value = env::var(name).ok();
    env::remove_var(name);
    value
}

/// Environment for the exec'd engine: the current environment minus loader
/// hooks, plus `extra`. Later entries in `extra` win.
pub fn engine_environment(extra: &[(&str, &str)]) -> BTreeMap<OsString, OsString> {
    let mut vars: BTreeMap<OsString, OsString> = env::vars_os()
        .filter(|(key, _)| {
            key.to_str()
                .map(|k| !STRIPPED_VARS.contains(&k))
                .unwrap_or(true)
        })
        .collect();

    for (key, value) in extra {
        vars.insert(OsString::from(key), OsString::from(value));
    }
    vars
}

/// `KEY=VALUE` strings for execve. Entries containing NUL are dropped.
pub fn to_envp(vars: &BTreeMap<OsString, OsString>) -> Vec<CString> {
    vars.iter()
        .filter_map(|(key, value)| {
            let mut entry = key.clone().into_vec();
            entry.push(b'=');
            entry.extend(value.clone().into_vec());
            CString::new(entry).ok()
        })
        .collect()
}

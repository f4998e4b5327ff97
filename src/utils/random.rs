/// Random names and shared secrets for the engine channel
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;

/// Socket file names are `cimd_` followed by this many characters
pub const SOCKET_NAME_RANDOM_LEN: usize = 9;
pub const SOCKET_NAME_PREFIX: &str = "cimd_";

/// Length of a per-cycle handoff secret
pub const SECRET_LEN: usize = 31;

pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh file name for the engine's named socket
pub fn socket_file_name() -> String {
    format!(
        "{}{}",
        SOCKET_NAME_PREFIX,
        random_alphanumeric(SOCKET_NAME_RANDOM_LEN)
    )
}

/// Shared secret; Debug output is redacted
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(String);

impl SecretToken {
    pub fn generate() -> Self {
        Self(random_alphanumeric(SECRET_LEN))
    }

    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison
    pub fn matches(&self, presented: &str) -> bool {
        let a = self.0.as_bytes();
        let b = presented.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretToken(<{} chars>)", self.0.len())
    }
}

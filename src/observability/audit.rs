/// Security audit trail for the daemon bootstrap
/// Structured events for every privilege-relevant action: ownership grants and
/// reverts, engine launches, rejected handshakes, environment scrubbing.
///
/// Each event is rendered as one JSON line on the `cimd::audit` log target and,
/// when an audit file has been configured, appended to that file as well.
use crate::config::types::{DaemonError, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use uuid::Uuid;

/// Log target carrying audit lines
pub const AUDIT_TARGET: &str = "cimd::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

/// Kinds of audited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    OwnershipChanged,
    OwnershipReverted,
    OwnershipRevertFailed,
    EngineLaunched,
    EngineExited,
    HandshakeRejected,
    EnvironmentScrubbed,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::OwnershipRevertFailed | AuditEventType::HandshakeRejected => {
                AuditSeverity::High
            }
            AuditEventType::OwnershipChanged | AuditEventType::EnvironmentScrubbed => {
                AuditSeverity::Medium
            }
            AuditEventType::OwnershipReverted
            | AuditEventType::EngineLaunched
            | AuditEventType::EngineExited => AuditSeverity::Low,
        }
    }
}

/// One audited action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    /// Incarnation of the server process that emitted the event
    pub incarnation: Uuid,
    pub process_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            incarnation: incarnation(),
            process_id: std::process::id(),
            path: None,
            pid: None,
        }
    }

    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Single JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"event_type\":\"{:?}\",\"serialization_error\":\"{}\"}}",
                self.event_type, e
            )
        })
    }
}

static INCARNATION: OnceLock<Uuid> = OnceLock::new();
static AUDIT_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Random id for this process, stable for its lifetime
pub fn incarnation() -> Uuid {
    *INCARNATION.get_or_init(Uuid::new_v4)
}

/// Also append audit lines to `path`. Only the first call takes effect.
pub fn init_audit_file(path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            DaemonError::Config(format!("Failed to create audit log directory: {}", e))
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DaemonError::Config(format!("Failed to open audit log: {}", e)))?;

    if AUDIT_FILE.set(Mutex::new(file)).is_err() {
        warn!("Audit file already initialized; ignoring {}", path.display());
    }
    Ok(path.to_path_buf())
}

/// Emit an event on the audit target and the audit file.
pub fn record(event: AuditEvent) {
    let line = event.to_json_line();
    match event.severity {
        AuditSeverity::High => error!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Medium => warn!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", line),
    }

    if let Some(file) = AUDIT_FILE.get() {
        match file.lock() {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{}", line).and_then(|_| f.flush()) {
                    error!("Failed to write audit log: {}", e);
                }
            }
            Err(_) => error!("Audit log lock poisoned"),
        }
    }
}

pub fn ownership_changed(path: &Path, from: (u32, u32), to: (u32, u32)) {
    record(
        AuditEvent::new(
            AuditEventType::OwnershipChanged,
            format!("{}:{} -> {}:{}", from.0, from.1, to.0, to.1),
        )
        .with_path(path),
    );
}

/// `failure` is None when the original owner was restored.
pub fn ownership_reverted(path: &Path, failure: Option<&str>) {
    let event = match failure {
        None => AuditEvent::new(AuditEventType::OwnershipReverted, "original owner restored"),
        Some(reason) => AuditEvent::new(AuditEventType::OwnershipRevertFailed, reason),
    };
    record(event.with_path(path));
}

pub fn engine_launched(pid: i32, binary: &Path, account: &str) {
    record(
        AuditEvent::new(
            AuditEventType::EngineLaunched,
            format!("engine running as {}", account),
        )
        .with_path(binary)
        .with_pid(pid),
    );
}

pub fn engine_exited(pid: i32, status: &str) {
    record(AuditEvent::new(AuditEventType::EngineExited, status).with_pid(pid));
}

pub fn handshake_rejected(endpoint: &Path, reason: &str) {
    record(AuditEvent::new(AuditEventType::HandshakeRejected, reason).with_path(endpoint));
}

/// A credential-file variable was present in the server environment.
pub fn ntlm_env_ignored(var: &str) {
    record(AuditEvent::new(
        AuditEventType::EnvironmentScrubbed,
        format!("{} removed from server environment", var),
    ));
}

//! Security Manager: profiles, volume/network/capability policy, audit log.
//!
//! The Allow/Deny decision shape is grounded on the corpus's `policy.rs`
//! (`PolicyDecision::{Allow, Deny, RequiresApproval}`), narrowed to what the
//! spec needs: there is no role/tool/budget concept here, only container
//! volume and network policy plus the fixed set of named security profiles
//! in §4.8. The audit log entry shape borrows the `{timestamp, category,
//! ...}` flavor of the corpus's `audit.rs`, but is the plain
//! newline-delimited-JSON-with-size-rotation scheme §4.8 specifies rather
//! than that file's hash-chained `AuditEntry` (see DESIGN.md).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("unknown security profile '{0}'")]
    UnknownProfile(String),
    #[error("volume path '{0}' is blocked")]
    BlockedPath(String),
    #[error("volume path '{0}' must be read-only under this path prefix")]
    RequiresReadOnly(String),
    #[error("too many volumes: {got} exceeds the maximum of {max}")]
    TooManyVolumes { got: usize, max: usize },
    #[error("volume path '{0}' is not absolute or contains '..'")]
    InvalidVolumePath(String),
    #[error("network '{0}' is not permitted without an explicit policy")]
    NetworkNotPermitted(String),
}

pub const DEFAULT_MAX_VOLUMES: usize = 5;

const BLOCKED_PATHS: &[&str] = &[
    "/etc",
    "/sys",
    "/proc",
    "/dev",
    "/root",
    "/home",
    "/var/run/docker.sock",
];

const READ_ONLY_PREFIXES: &[&str] = &["/usr", "/bin", "/sbin", "/lib"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProfile {
    Strict,
    Moderate,
    Minimal,
}

impl SecurityProfile {
    pub fn parse(name: &str) -> Result<Self, SecurityError> {
        match name {
            "strict" => Ok(Self::Strict),
            "moderate" => Ok(Self::Moderate),
            "minimal" => Ok(Self::Minimal),
            other => Err(SecurityError::UnknownProfile(other.to_string())),
        }
    }

    pub fn no_new_privileges(self) -> bool {
        true
    }

    pub fn read_only_root_fs(self) -> bool {
        !matches!(self, Self::Minimal)
    }

    pub fn default_network(self) -> &'static str {
        match self {
            Self::Strict | Self::Moderate => "none",
            Self::Minimal => "bridge",
        }
    }

    pub fn added_capabilities(self) -> &'static [&'static str] {
        match self {
            Self::Strict => &[],
            Self::Moderate => &["CHOWN", "SETUID", "SETGID", "NET_BIND_SERVICE"],
            Self::Minimal => &[],
        }
    }
}

/// Network policy attached to a container step when its network is not `none`.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    pub allow_localhost: bool,
    pub allowed_hosts: Vec<String>,
}

impl NetworkPolicy {
    fn is_explicit(&self) -> bool {
        self.allow_localhost || !self.allowed_hosts.is_empty()
    }
}

/// `none` is always allowed; anything else requires an explicit policy.
pub fn check_network(network: &str, policy: &NetworkPolicy) -> Result<(), SecurityError> {
    if network == "none" {
        return Ok(());
    }
    if policy.is_explicit() {
        return Ok(());
    }
    Err(SecurityError::NetworkNotPermitted(network.to_string()))
}

/// Volume policy: blocked paths always rejected; a fixed set of read-only
/// prefixes must be mounted read-only; absolute paths only, no `..`.
pub fn check_volume_path(container_host_path: &str, read_only: bool) -> Result<(), SecurityError> {
    let path = Path::new(container_host_path);
    if !path.is_absolute() || container_host_path.split('/').any(|seg| seg == "..") {
        return Err(SecurityError::InvalidVolumePath(container_host_path.to_string()));
    }
    for blocked in BLOCKED_PATHS {
        if container_host_path == *blocked || container_host_path.starts_with(&format!("{blocked}/")) {
            return Err(SecurityError::BlockedPath(container_host_path.to_string()));
        }
    }
    for prefix in READ_ONLY_PREFIXES {
        if container_host_path == *prefix || container_host_path.starts_with(&format!("{prefix}/")) {
            if !read_only {
                return Err(SecurityError::RequiresReadOnly(container_host_path.to_string()));
            }
        }
    }
    Ok(())
}

pub fn check_volume_count(count: usize, max: usize) -> Result<(), SecurityError> {
    if count > max {
        return Err(SecurityError::TooManyVolumes { got: count, max });
    }
    Ok(())
}

/// A fixed allowlist of Linux capabilities a step may request.
pub fn capability_allowlist() -> &'static HashSet<&'static str> {
    use std::sync::OnceLock;
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| {
        [
            "CHOWN",
            "DAC_OVERRIDE",
            "FOWNER",
            "FSETID",
            "KILL",
            "SETGID",
            "SETUID",
            "SETPCAP",
            "NET_BIND_SERVICE",
            "NET_RAW",
            "SYS_CHROOT",
            "MKNOD",
            "AUDIT_WRITE",
            "SETFCAP",
        ]
        .into_iter()
        .collect()
    })
}

/// One newline-delimited-JSON audit log, rotated by size (§4.8).
pub struct AuditLog {
    path: std::path::PathBuf,
    max_bytes: u64,
    inner: Mutex<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub action: String,
    pub resource: String,
    pub result: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl AuditLog {
    pub fn new(path: impl Into<std::path::PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            inner: Mutex::new(()),
        }
    }

    /// Appends one record; rotates `.1`, `.2`, … when the file would exceed
    /// `max_bytes`. Writer and rotation share the same internal lock.
    pub fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let _guard = self.inner.lock().expect("audit log mutex poisoned");
        self.rotate_if_needed()?;
        let line = serde_json::to_string(entry).expect("audit entry always serializes");
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let current_len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if current_len < self.max_bytes {
            return Ok(());
        }
        let mut index = 1;
        loop {
            let candidate = self.path.with_extension(format!("{index}"));
            if !candidate.exists() {
                std::fs::rename(&self.path, &candidate)?;
                return Ok(());
            }
            index += 1;
        }
    }

    /// Called on every container run, success or failure.
    pub fn audit_container_execution(
        &self,
        run_id: &str,
        step_id: &str,
        image: &str,
        success: bool,
        details: Value,
    ) -> std::io::Result<()> {
        self.append(&AuditEntry {
            timestamp: Utc::now(),
            entry_type: "container_execution".to_string(),
            run_id: Some(run_id.to_string()),
            step_id: Some(step_id.to_string()),
            user: None,
            action: "run_container".to_string(),
            resource: image.to_string(),
            result: if success { "success" } else { "failure" }.to_string(),
            details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn profile_shapes_match_spec() {
        assert_eq!(SecurityProfile::Strict.default_network(), "none");
        assert_eq!(SecurityProfile::Minimal.default_network(), "bridge");
        assert_eq!(
            SecurityProfile::Moderate.added_capabilities(),
            &["CHOWN", "SETUID", "SETGID", "NET_BIND_SERVICE"]
        );
        assert!(!SecurityProfile::Minimal.read_only_root_fs());
        assert!(SecurityProfile::Strict.read_only_root_fs());
    }

    #[test]
    fn blocked_paths_rejected() {
        assert!(check_volume_path("/etc/passwd", true).is_err());
        assert!(check_volume_path("/var/run/docker.sock", true).is_err());
    }

    #[test]
    fn read_only_prefixes_require_read_only_mount() {
        assert!(check_volume_path("/usr/local/bin", false).is_err());
        assert!(check_volume_path("/usr/local/bin", true).is_ok());
    }

    #[test]
    fn relative_or_traversal_paths_rejected() {
        assert!(check_volume_path("relative/path", false).is_err());
        assert!(check_volume_path("/workspace/../etc", false).is_err());
    }

    #[test]
    fn network_none_always_allowed() {
        assert!(check_network("none", &NetworkPolicy::default()).is_ok());
        assert!(check_network("bridge", &NetworkPolicy::default()).is_err());
        let policy = NetworkPolicy {
            allow_localhost: true,
            allowed_hosts: vec![],
        };
        assert!(check_network("bridge", &policy).is_ok());
    }

    #[test]
    fn audit_log_rotates_past_size_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let log = AuditLog::new(&path, 64);
        for i in 0..20 {
            log.audit_container_execution("run-1", "step", "alpine:latest", true, json!({"i": i}))
                .unwrap();
        }
        assert!(path.exists());
        assert!(path.with_extension("1").exists());
    }
}

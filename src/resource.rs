//! Resource Manager: global and per-repository CPU/memory quotas (§4.9).
//!
//! Grounded on the corpus's `capacity.rs` quota-table shape, narrowed to a
//! flat two-tier (global, per-repo) model with no scheduler or reservation
//! queue — quota checks here are pure validation, not admission control.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("malformed cpu quantity '{0}'")]
    MalformedCpu(String),
    #[error("malformed memory quantity '{0}'")]
    MalformedMemory(String),
    #[error("cpu request {requested} exceeds repository quota {quota} for '{repo}'")]
    CpuExceedsRepoQuota { repo: String, requested: f64, quota: f64 },
    #[error("cpu request {requested} exceeds global quota {quota}")]
    CpuExceedsGlobalQuota { requested: f64, quota: f64 },
    #[error("memory request {requested} exceeds repository quota {quota} for '{repo}'")]
    MemoryExceedsRepoQuota { repo: String, requested: u64, quota: u64 },
    #[error("memory request {requested} exceeds global quota {quota}")]
    MemoryExceedsGlobalQuota { requested: u64, quota: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Quota {
    /// Fractional CPU cores, e.g. `2.5`. `None` means unbounded.
    pub cpu: Option<f64>,
    /// Bytes. `None` means unbounded.
    pub memory: Option<u64>,
}

/// Parses a CPU quantity: a bare decimal number of cores (`"0.5"`, `"2"`).
pub fn parse_cpu(value: &str) -> Result<f64, ResourceError> {
    value.trim().parse::<f64>().map_err(|_| ResourceError::MalformedCpu(value.to_string()))
}

/// Parses a memory quantity: `<integer>{Ki,Mi,Gi,K,M,G,B}`. Per the resolved
/// Open Question, bare `K`/`M`/`G` are binary (same multiplier as `Ki`/`Mi`/`Gi`);
/// `B` means bytes with no multiplier.
pub fn parse_memory(value: &str) -> Result<u64, ResourceError> {
    let value = value.trim();
    let split_at = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| ResourceError::MalformedMemory(value.to_string()))?;
    let (digits, unit) = value.split_at(split_at);
    let amount: u64 = digits.parse().map_err(|_| ResourceError::MalformedMemory(value.to_string()))?;

    let multiplier: u64 = match unit {
        "B" => 1,
        "K" | "Ki" => 1024,
        "M" | "Mi" => 1024 * 1024,
        "G" | "Gi" => 1024 * 1024 * 1024,
        _ => return Err(ResourceError::MalformedMemory(value.to_string())),
    };
    Ok(amount * multiplier)
}

#[derive(Debug, Clone, Default)]
pub struct ResourceManager {
    global: Quota,
    per_repo: HashMap<String, Quota>,
}

impl ResourceManager {
    pub fn new(global: Quota) -> Self {
        Self {
            global,
            per_repo: HashMap::new(),
        }
    }

    pub fn set_repo_quota(&mut self, repo: impl Into<String>, quota: Quota) {
        self.per_repo.insert(repo.into(), quota);
    }

    /// Validates a request against the repo quota (if any) and the global
    /// quota. Dimensions absent from the request (no `cpu`/`memory` field on
    /// the step) are skipped entirely, matching §4.9's "only dimensions the
    /// step actually requests are checked".
    pub fn validate_request(&self, repo: &str, cpu: Option<&str>, memory: Option<&str>) -> Result<(), ResourceError> {
        if let Some(cpu) = cpu {
            let requested = parse_cpu(cpu)?;
            if let Some(repo_quota) = self.per_repo.get(repo).and_then(|q| q.cpu) {
                if requested > repo_quota {
                    return Err(ResourceError::CpuExceedsRepoQuota {
                        repo: repo.to_string(),
                        requested,
                        quota: repo_quota,
                    });
                }
            }
            if let Some(global_quota) = self.global.cpu {
                if requested > global_quota {
                    return Err(ResourceError::CpuExceedsGlobalQuota {
                        requested,
                        quota: global_quota,
                    });
                }
            }
        }

        if let Some(memory) = memory {
            let requested = parse_memory(memory)?;
            if let Some(repo_quota) = self.per_repo.get(repo).and_then(|q| q.memory) {
                if requested > repo_quota {
                    return Err(ResourceError::MemoryExceedsRepoQuota {
                        repo: repo.to_string(),
                        requested,
                        quota: repo_quota,
                    });
                }
            }
            if let Some(global_quota) = self.global.memory {
                if requested > global_quota {
                    return Err(ResourceError::MemoryExceedsGlobalQuota {
                        requested,
                        quota: global_quota,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_byte_memory_units() {
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("100B").unwrap(), 100);
        assert_eq!(parse_memory("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_malformed_memory() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("10Tb").is_err());
    }

    #[test]
    fn no_dimensions_requested_is_always_ok() {
        let mut mgr = ResourceManager::new(Quota { cpu: Some(1.0), memory: Some(1024) });
        mgr.set_repo_quota("org/repo", Quota { cpu: Some(0.1), memory: Some(1) });
        assert!(mgr.validate_request("org/repo", None, None).is_ok());
    }

    #[test]
    fn repo_quota_enforced_before_global() {
        let mut mgr = ResourceManager::new(Quota { cpu: Some(4.0), memory: None });
        mgr.set_repo_quota("org/repo", Quota { cpu: Some(1.0), memory: None });
        assert!(mgr.validate_request("org/repo", Some("2"), None).is_err());
        assert!(mgr.validate_request("org/other", Some("2"), None).is_ok());
    }

    #[test]
    fn global_quota_enforced_when_no_repo_quota() {
        let mgr = ResourceManager::new(Quota { cpu: None, memory: Some(1024 * 1024) });
        assert!(mgr.validate_request("org/repo", None, Some("2Mi")).is_err());
        assert!(mgr.validate_request("org/repo", None, Some("512Ki")).is_ok());
    }
}

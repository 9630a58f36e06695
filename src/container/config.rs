//! Config build: validates a `ContainerStep` and applies secure defaults
//! (§4.7). A named security profile (§4.8) may further modify the result.

use std::collections::HashMap;

use once_cell_regex::image_name_regex;
use serde::Serialize;

use crate::config::ContainerStep;
use crate::error::EngineError;
use crate::security::{self, NetworkPolicy, SecurityProfile};

const DEFAULT_RUN_AS_USER: u32 = 1001;
const WORKSPACE_MOUNT: &str = "/workspace";

#[derive(Debug, Clone, Serialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerConfig {
    pub image: String,
    pub run: Option<String>,
    pub env: HashMap<String, String>,
    pub network: String,
    pub capabilities: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub run_as_user: u32,
    pub read_only_root_fs: bool,
    pub no_new_privileges: bool,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// `[registry[:port]/][namespace/]name[:tag][@sha256:<64hex>]`; `..` and
/// `!` are rejected outright regardless of the regex match.
pub fn validate_image_name(image: &str) -> Result<(), EngineError> {
    if image.contains("..") || image.contains('!') {
        return Err(EngineError::validation(format!(
            "image name '{image}' contains a disallowed sequence"
        )));
    }
    if !image_name_regex().is_match(image) {
        return Err(EngineError::validation(format!(
            "image name '{image}' does not match the expected grammar"
        )));
    }
    Ok(())
}

pub fn validate_capabilities(capabilities: &[String]) -> Result<(), EngineError> {
    let allowlist = security::capability_allowlist();
    for cap in capabilities {
        if !allowlist.contains(cap.as_str()) {
            return Err(EngineError::validation(format!(
                "capability '{cap}' is not in the allowed set"
            )));
        }
    }
    Ok(())
}

/// Builds and validates a [`ContainerConfig`] from a step, the workspace's
/// write mount, and an optional network policy for non-`none` networks.
pub fn build_container_config(
    step: &ContainerStep,
    network_policy: &NetworkPolicy,
) -> Result<ContainerConfig, EngineError> {
    validate_image_name(&step.image)?;
    validate_capabilities(&step.capabilities)?;

    let profile = step
        .security_profile
        .as_deref()
        .map(SecurityProfile::parse)
        .transpose()
        .map_err(|e| EngineError::validation(e.to_string()))?
        .unwrap_or(SecurityProfile::Strict);

    let network = step
        .network
        .clone()
        .unwrap_or_else(|| profile.default_network().to_string());
    security::check_network(&network, network_policy).map_err(|e| EngineError::validation(e.to_string()))?;

    security::check_volume_count(step.volumes.len(), security::DEFAULT_MAX_VOLUMES)
        .map_err(|e| EngineError::validation(e.to_string()))?;

    let mut volumes = Vec::with_capacity(step.volumes.len() + 1);
    for v in &step.volumes {
        security::check_volume_path(&v.host_path, v.read_only).map_err(|e| EngineError::validation(e.to_string()))?;
        volumes.push(VolumeMount {
            host_path: v.host_path.clone(),
            container_path: v.container_path.clone(),
            read_only: v.read_only,
        });
    }

    let mut capabilities: Vec<String> = step.capabilities.clone();
    for cap in profile.added_capabilities() {
        if !capabilities.iter().any(|c| c == cap) {
            capabilities.push(cap.to_string());
        }
    }

    let mut env = step.env.clone();
    env.insert("TAKO_CONTAINER".to_string(), "true".to_string());

    let (cpu, memory) = step
        .resources
        .as_ref()
        .map(|r| (r.cpu.clone(), r.memory.clone()))
        .unwrap_or((None, None));

    Ok(ContainerConfig {
        image: step.image.clone(),
        run: step.run.clone(),
        env,
        network,
        capabilities,
        volumes,
        run_as_user: DEFAULT_RUN_AS_USER,
        read_only_root_fs: profile.read_only_root_fs(),
        no_new_privileges: profile.no_new_privileges(),
        cpu,
        memory,
    })
}

impl ContainerConfig {
    /// The single writable workspace mount, added by the caller once it
    /// knows the workspace path (kept out of `build_container_config` so
    /// this module stays free of filesystem layout concerns).
    pub fn with_workspace_mount(mut self, workspace_host_path: &str) -> Self {
        self.volumes.push(VolumeMount {
            host_path: workspace_host_path.to_string(),
            container_path: WORKSPACE_MOUNT.to_string(),
            read_only: false,
        });
        self
    }
}

/// Small helper module so the image-name regex is compiled once.
mod once_cell_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn image_name_regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(
                r"^(?:[a-zA-Z0-9.-]+(?::[0-9]+)?/)?(?:[a-zA-Z0-9._-]+/)?[a-zA-Z0-9._-]+(?::[a-zA-Z0-9._-]+)?(?:@sha256:[0-9a-f]{64})?$",
            )
            .expect("static image name regex is valid")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeSpec;

    fn step(image: &str) -> ContainerStep {
        ContainerStep {
            id: "build".to_string(),
            image: image.to_string(),
            run: Some("echo hi".to_string()),
            env: HashMap::new(),
            network: None,
            capabilities: vec![],
            volumes: vec![],
            resources: None,
            security_profile: None,
            produces: None,
        }
    }

    #[test]
    fn valid_image_names() {
        assert!(validate_image_name("alpine").is_ok());
        assert!(validate_image_name("library/alpine:3.19").is_ok());
        assert!(validate_image_name("registry.example.com:5000/team/app:latest").is_ok());
        assert!(validate_image_name(&format!("alpine@sha256:{}", "a".repeat(64))).is_ok());
    }

    #[test]
    fn rejects_traversal_and_bang() {
        assert!(validate_image_name("../etc/passwd").is_err());
        assert!(validate_image_name("alpine!latest").is_err());
    }

    #[test]
    fn secure_defaults_applied() {
        let cfg = build_container_config(&step("alpine"), &NetworkPolicy::default()).unwrap();
        assert_eq!(cfg.run_as_user, 1001);
        assert!(cfg.read_only_root_fs);
        assert!(cfg.no_new_privileges);
        assert_eq!(cfg.network, "none");
        assert!(cfg.capabilities.is_empty());
        assert_eq!(cfg.env.get("TAKO_CONTAINER").unwrap(), "true");
    }

    #[test]
    fn moderate_profile_adds_capabilities() {
        let mut s = step("alpine");
        s.security_profile = Some("moderate".to_string());
        let cfg = build_container_config(&s, &NetworkPolicy::default()).unwrap();
        assert!(cfg.capabilities.contains(&"CHOWN".to_string()));
        assert!(cfg.read_only_root_fs); // moderate is still read-only
    }

    #[test]
    fn rejects_disallowed_capability() {
        let mut s = step("alpine");
        s.capabilities = vec!["SYS_ADMIN".to_string()];
        assert!(build_container_config(&s, &NetworkPolicy::default()).is_err());
    }

    #[test]
    fn rejects_blocked_volume() {
        let mut s = step("alpine");
        s.volumes = vec![VolumeSpec {
            host_path: "/etc".to_string(),
            container_path: "/mnt/etc".to_string(),
            read_only: true,
        }];
        assert!(build_container_config(&s, &NetworkPolicy::default()).is_err());
    }

    #[test]
    fn too_many_volumes_rejected() {
        let mut s = step("alpine");
        s.volumes = (0..6)
            .map(|i| VolumeSpec {
                host_path: format!("/data/{i}"),
                container_path: format!("/mnt/{i}"),
                read_only: true,
            })
            .collect();
        assert!(build_container_config(&s, &NetworkPolicy::default()).is_err());
    }
}

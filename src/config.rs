//! `tako.yml` shape: deserialized with `serde` + `serde_yaml` into owned
//! structs. This module owns only the *shape*; the schema loader mentioned
//! in the spec's Out-of-scope list is an external concern that feeds a
//! [`WorkflowConfig`] in, constructed however the caller likes (this crate
//! only needs `WorkflowConfig::from_yaml_str` for convenience and tests).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub version: String,
    #[serde(default)]
    pub artifacts: HashMap<String, ArtifactSpec>,
    pub workflows: HashMap<String, WorkflowSpec>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionSpec>,
}

impl WorkflowConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(s)
            .map_err(|e| EngineError::configuration(format!("failed to parse tako.yml: {e}")))
    }

    pub fn load(repo_path: &Path) -> Result<Self, EngineError> {
        let path = repo_path.join("tako.yml");
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::configuration(format!("missing or unreadable {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn workflow(&self, name: &str) -> Result<&WorkflowSpec, EngineError> {
        self.workflows
            .get(name)
            .ok_or_else(|| EngineError::configuration(format!("unknown workflow '{name}'")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub path: String,
    #[serde(default)]
    pub ecosystem: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub inputs: HashMap<String, InputSpec>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub validation: Option<InputValidation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputValidation {
    #[serde(rename = "enum", default)]
    pub enum_values: Vec<String>,
}

/// One workflow step. Kind is inferred from which of `uses` / `image` /
/// `run` is present, with priority `uses > image > run` (§3), not a serde
/// tag — so this type deserializes through [`RawStep`] and converts.
#[derive(Debug, Clone, Serialize)]
#[serde(into = "RawStep")]
pub enum Step {
    Shell(ShellStep),
    Container(ContainerStep),
    BuiltIn(BuiltInStep),
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Shell(s) => &s.id,
            Step::Container(s) => &s.id,
            Step::BuiltIn(s) => &s.id,
        }
    }

    pub fn produces(&self) -> Option<&ProducesSpec> {
        match self {
            Step::Shell(s) => s.produces.as_ref(),
            Step::Container(s) => s.produces.as_ref(),
            Step::BuiltIn(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellStep {
    pub id: String,
    pub run: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub produces: Option<ProducesSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStep {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub security_profile: Option<String>,
    #[serde(default)]
    pub produces: Option<ProducesSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltInStep {
    pub id: String,
    /// `"<name>@<version>"`, e.g. `tako/fan-out@v1`.
    pub uses: String,
    #[serde(default)]
    pub with: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducesSpec {
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub artifact: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub filters: Vec<String>,
    pub workflow: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

/// Flattened wire shape used purely for (de)serialization of [`Step`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    id: String,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    with: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    volumes: Vec<VolumeSpec>,
    #[serde(default)]
    resources: Option<ResourceSpec>,
    #[serde(default)]
    security_profile: Option<String>,
    #[serde(default)]
    produces: Option<ProducesSpec>,
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawStep::deserialize(deserializer)?;
        if let Some(uses) = raw.uses {
            return Ok(Step::BuiltIn(BuiltInStep {
                id: raw.id,
                uses,
                with: raw.with,
            }));
        }
        if let Some(image) = raw.image {
            return Ok(Step::Container(ContainerStep {
                id: raw.id,
                image,
                run: raw.run,
                env: raw.env,
                network: raw.network,
                capabilities: raw.capabilities,
                volumes: raw.volumes,
                resources: raw.resources,
                security_profile: raw.security_profile,
                produces: raw.produces,
            }));
        }
        if let Some(run) = raw.run {
            return Ok(Step::Shell(ShellStep {
                id: raw.id,
                run,
                env: raw.env,
                produces: raw.produces,
            }));
        }
        Err(serde::de::Error::custom(format!(
            "step '{}' has none of `uses`, `image`, or `run`",
            raw.id
        )))
    }
}

impl From<Step> for RawStep {
    fn from(step: Step) -> Self {
        match step {
            Step::Shell(s) => RawStep {
                id: s.id,
                uses: None,
                with: Default::default(),
                image: None,
                run: Some(s.run),
                env: s.env,
                network: None,
                capabilities: Vec::new(),
                volumes: Vec::new(),
                resources: None,
                security_profile: None,
                produces: s.produces,
            },
            Step::Container(s) => RawStep {
                id: s.id,
                uses: None,
                with: Default::default(),
                image: Some(s.image),
                run: s.run,
                env: s.env,
                network: s.network,
                capabilities: s.capabilities,
                volumes: s.volumes,
                resources: s.resources,
                security_profile: s.security_profile,
                produces: s.produces,
            },
            Step::BuiltIn(s) => RawStep {
                id: s.id,
                uses: Some(s.uses),
                with: s.with,
                image: None,
                run: None,
                env: HashMap::new(),
                network: None,
                capabilities: Vec::new(),
                volumes: Vec::new(),
                resources: None,
                security_profile: None,
                produces: None,
            },
        }
    }
}

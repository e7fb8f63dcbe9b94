use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    Mock,
    LocalAccelerator,
    LocalCpu,
    Remote,
}

impl RunnerType {
    /// Runners of this type execute a downloaded model from local storage.
    pub fn uses_local_model(&self) -> bool {
        matches!(self, RunnerType::LocalAccelerator | RunnerType::LocalCpu)
    }
}

/// A condition that must hold before a definition is eligible for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareRequirement {
    Npu,
    Gpu,
    MinRamGb(u32),
    Network,
    ApiKey,
    LocalRuntime,
}

impl fmt::Display for HardwareRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareRequirement::Npu => f.write_str("npu"),
            HardwareRequirement::Gpu => f.write_str("gpu"),
            HardwareRequirement::MinRamGb(gb) => write!(f, "ram>={}GB", gb),
            HardwareRequirement::Network => f.write_str("network"),
            HardwareRequirement::ApiKey => f.write_str("api_key"),
            HardwareRequirement::LocalRuntime => f.write_str("local_runtime"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Declarative entry of the runner table. Immutable after loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerDefinition {
    pub name: String,
    /// Key into the runner factory's constructor table.
    pub implementation: String,
    /// Lower is preferred.
    pub priority: u32,
    #[serde(rename = "type")]
    pub runner_type: RunnerType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub requirements: Vec<HardwareRequirement>,
    #[serde(default)]
    pub default_model_id: Option<String>,
    /// Always-available definition used when nothing else qualifies.
    #[serde(default)]
    pub fallback: bool,
}

impl RunnerDefinition {
    pub fn new(name: &str, implementation: &str, priority: u32, runner_type: RunnerType) -> Self {
        Self {
            name: name.to_string(),
            implementation: implementation.to_string(),
            priority,
            runner_type,
            enabled: true,
            requirements: Vec::new(),
            default_model_id: None,
            fallback: false,
        }
    }

    pub fn requires(mut self, requirement: HardwareRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn with_default_model(mut self, model_id: &str) -> Self {
        self.default_model_id = Some(model_id.to_string());
        self
    }

    pub fn as_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// --- Resource requirements ---

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// CPU in millicores (1000 = 1 core)
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
}

// --- Container spec ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub volume_mounts: Vec<crate::volume::VolumeMount>,
}

// --- Pod template ---

/// Template every replica instance is created from.
///
/// Maps are ordered so that serializing the template is deterministic;
/// the template revision hash depends on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    /// Explicit runtime selection passed through to the runtime driver.
    #[serde(default)]
    pub runtime: Option<String>,
}

impl PodTemplate {
    /// Image of the first container, used in log lines.
    pub fn primary_image(&self) -> &str {
        self.containers
            .first()
            .map(|c| c.image.as_str())
            .unwrap_or("<none>")
    }
}

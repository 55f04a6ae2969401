use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Volume mount in a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    /// Name of the volume (must match the claim template name)
    pub name: String,
    /// Path inside the container to mount the volume
    pub mount_path: String,
    /// Whether to mount read-only
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

/// Template for the per-ordinal persistent volume claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeClaimTemplate {
    /// Template name; the first segment of every claim name.
    pub name: String,
    /// Storage class name (e.g. "default", "fast-ssd")
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<AccessMode>,
    /// Requested storage in bytes
    #[serde(default)]
    pub requested_bytes: u64,
}

fn default_access_modes() -> Vec<AccessMode> {
    vec![AccessMode::ReadWriteOnce]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BindingStatus {
    #[default]
    Unbound,
    Bound,
}

impl std::fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingStatus::Unbound => write!(f, "Unbound"),
            BindingStatus::Bound => write!(f, "Bound"),
        }
    }
}

/// Last provisioning failure of a claim, with the time the next attempt is due.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningFailure {
    pub reason: String,
    pub retry_at: DateTime<Utc>,
}

/// Durable association between an ordinal and its persistent volume claim.
///
/// Created at most once per ordinal and never deleted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeBinding {
    pub ordinal: u32,
    pub claim_name: String,
    #[serde(default)]
    pub status: BindingStatus,
    /// Pod reference of the instance currently using the claim.
    #[serde(default)]
    pub attached_to: Option<String>,
    /// Number of claim requests issued to the provisioner.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub failure: Option<ProvisioningFailure>,
    pub created_at: DateTime<Utc>,
}

impl VolumeBinding {
    pub fn is_bound(&self) -> bool {
        self.status == BindingStatus::Bound
    }
}

/// Status reported by the volume provisioner for one claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClaimEvent {
    Unbound,
    Bound,
    ProvisioningFailed(String),
}

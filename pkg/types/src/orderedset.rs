use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pod::PodTemplate;
use crate::volume::VolumeClaimTemplate;

// --- Policies ---

/// How replicas are created and deleted while scaling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ManagementPolicy {
    /// Create ascending, one at a time, each gated on its predecessor being
    /// ready. Delete descending, one at a time.
    #[default]
    Ordered,
    /// Issue every create and delete at once. Identity and storage
    /// guarantees are unaffected.
    Parallel,
}

/// What happens to a replica whose instance failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Delete the failed instance after a backoff and recreate it in place.
    #[default]
    Always,
    /// Leave the replica Failed until an operator intervenes.
    Never,
}

// --- OrderedSet spec ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderedSetSpec {
    /// Desired replica count. Signed so malformed manifests can be rejected
    /// instead of silently wrapping.
    pub replicas: i32,
    pub template: PodTemplate,
    #[serde(default, alias = "volume-claim-template")]
    pub volume_claim_template: Option<VolumeClaimTemplate>,
    /// Headless service the per-replica DNS records are published under.
    #[serde(alias = "service-name")]
    pub service_name: String,
    /// Template updates only roll ordinals `>= update_partition`.
    #[serde(default, alias = "update-partition")]
    pub update_partition: i32,
    #[serde(default, alias = "management-policy")]
    pub management_policy: ManagementPolicy,
    #[serde(default, alias = "restart-policy")]
    pub restart_policy: RestartPolicy,
}

// --- OrderedSet status ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionKind {
    /// A claim could not be bound; the replica stays Pending and is retried.
    ProvisioningFailed,
    /// An instance failed to start or crashed while Ready.
    StartupFailed,
    /// An Ordered pass has been blocked on one ordinal past the stall threshold.
    StalledOrdering,
    /// The latest desired state was rejected; the previous one stays in force.
    InvalidSpec,
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionKind::ProvisioningFailed => write!(f, "ProvisioningFailed"),
            ConditionKind::StartupFailed => write!(f, "StartupFailed"),
            ConditionKind::StalledOrdering => write!(f, "StalledOrdering"),
            ConditionKind::InvalidSpec => write!(f, "InvalidSpec"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetCondition {
    pub kind: ConditionKind,
    /// Ordinal the condition is scoped to; `None` for set-wide conditions.
    #[serde(default)]
    pub ordinal: Option<u32>,
    pub message: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderedSetStatus {
    #[serde(default)]
    pub observed_generation: u64,
    /// Replicas with a live instance (Creating, Ready, Terminating, Failed)
    pub replicas: u32,
    pub ready_replicas: u32,
    /// Replicas inside the desired range running the current template
    pub updated_replicas: u32,
    #[serde(default)]
    pub current_revision: String,
    #[serde(default)]
    pub conditions: Vec<SetCondition>,
}

impl OrderedSetStatus {
    pub fn condition(&self, kind: ConditionKind) -> Option<&SetCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

// --- OrderedSet ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrderedSet {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bumped by the writer on every spec change.
    #[serde(default)]
    pub generation: u64,
    pub spec: OrderedSetSpec,
    #[serde(default)]
    pub status: OrderedSetStatus,
}

fn default_namespace() -> String {
    pkg_constants::network::DEFAULT_NAMESPACE.to_string()
}

// --- Replica phase ---

/// Why a replica's instance is being deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TerminationCause {
    /// Ordinal is outside the desired range.
    ScaleDown,
    /// Instance runs an outdated template revision.
    Update,
    /// Failed instance is being replaced.
    Restart,
    /// Deleted by an operator or lost by the runtime.
    External,
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationCause::ScaleDown => write!(f, "scale-down"),
            TerminationCause::Update => write!(f, "update"),
            TerminationCause::Restart => write!(f, "restart"),
            TerminationCause::External => write!(f, "external"),
        }
    }
}

/// Lifecycle phase of one ordinal slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicaPhase {
    Pending,
    Creating,
    Ready,
    Terminating(TerminationCause),
    Gone,
    Failed(String),
}

impl ReplicaPhase {
    /// Short name without payload, for logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            ReplicaPhase::Pending => "Pending",
            ReplicaPhase::Creating => "Creating",
            ReplicaPhase::Ready => "Ready",
            ReplicaPhase::Terminating(_) => "Terminating",
            ReplicaPhase::Gone => "Gone",
            ReplicaPhase::Failed(_) => "Failed",
        }
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, ReplicaPhase::Terminating(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReplicaPhase::Failed(_))
    }
}

impl std::fmt::Display for ReplicaPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaPhase::Terminating(cause) => write!(f, "Terminating({})", cause),
            ReplicaPhase::Failed(reason) => write!(f, "Failed: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

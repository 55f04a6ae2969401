//! Validated, immutable snapshot of what a set should look like.

use crate::error::{ControllerError, ControllerResult};
use pkg_types::orderedset::{ManagementPolicy, OrderedSet, RestartPolicy};
use pkg_types::pod::PodTemplate;
use pkg_types::validate::validate_ordered_set;
use pkg_types::volume::VolumeClaimTemplate;

/// Desired state consumed by one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub set_name: String,
    pub namespace: String,
    pub generation: u64,
    pub replicas: u32,
    pub partition: u32,
    pub policy: ManagementPolicy,
    pub restart_policy: RestartPolicy,
    pub template: PodTemplate,
    pub volume_template: Option<VolumeClaimTemplate>,
    pub service_name: String,
    /// Hash of `template`; instances carrying a different value are outdated.
    pub revision: String,
}

impl DesiredState {
    /// Validate a manifest and turn it into a snapshot. Nothing is applied on error.
    pub fn from_set(set: &OrderedSet) -> ControllerResult<Self> {
        validate_ordered_set(set)
            .map_err(|e| ControllerError::invalid_spec(&set.name, e.to_string()))?;
        Ok(Self {
            set_name: set.name.clone(),
            namespace: set.namespace.clone(),
            generation: set.generation,
            // Non-negative after validation
            replicas: set.spec.replicas.unsigned_abs(),
            partition: set.spec.update_partition.unsigned_abs(),
            policy: set.spec.management_policy,
            restart_policy: set.spec.restart_policy,
            template: set.spec.template.clone(),
            volume_template: set.spec.volume_claim_template.clone(),
            service_name: set.spec.service_name.clone(),
            revision: template_revision(&set.spec.template),
        })
    }
}

/// Stable hash of a pod template.
pub fn template_revision(template: &PodTemplate) -> String {
    let json = serde_json::to_string(template).unwrap_or_default();
    let mut hash: u64 = 0;
    for byte in json.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
    }
    format!("{:016x}", hash)
}

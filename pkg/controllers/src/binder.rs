//! Ordinal → persistent volume claim bindings.
//!
//! A binding is allocated the first time an ordinal needs storage and is
//! then kept for the lifetime of the set's name. Scaling down, restarting
//! or deleting the set only detaches it; the claim itself is deleted
//! solely by an explicit operator call to the provisioner.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{ControllerError, ControllerResult};
use crate::identity::claim_name;
use pkg_types::volume::{
    BindingStatus, ClaimEvent, ProvisioningFailure, VolumeBinding, VolumeClaimTemplate,
};

/// Claim the provisioner must be asked to create (or re-create after a failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub ordinal: u32,
    pub claim_name: String,
    pub template: VolumeClaimTemplate,
}

/// Result of [`StorageBinder::ensure`].
#[derive(Debug, Clone)]
pub struct Ensured {
    pub binding: VolumeBinding,
    /// Set when the provisioner needs to be called.
    pub request: Option<ClaimRequest>,
}

pub struct StorageBinder {
    set_name: String,
    bindings: BTreeMap<u32, VolumeBinding>,
    backoff: Backoff,
    dirty: BTreeSet<u32>,
}

impl StorageBinder {
    pub fn new(set_name: &str, backoff: Backoff) -> Self {
        Self {
            set_name: set_name.to_string(),
            bindings: BTreeMap::new(),
            backoff,
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuild from persisted bindings.
    pub fn restore(
        set_name: &str,
        backoff: Backoff,
        bindings: impl IntoIterator<Item = VolumeBinding>,
    ) -> Self {
        let mut binder = Self::new(set_name, backoff);
        binder.bindings = bindings.into_iter().map(|b| (b.ordinal, b)).collect();
        binder
    }

    /// Return the binding for `ordinal`, allocating it on first use.
    ///
    /// Idempotent: an existing binding is returned unchanged, even if the
    /// template was renamed since it was allocated. A claim that failed to
    /// provision is re-requested once its backoff has expired.
    pub fn ensure(
        &mut self,
        ordinal: u32,
        template: &VolumeClaimTemplate,
        now: DateTime<Utc>,
    ) -> Ensured {
        if let Some(binding) = self.bindings.get_mut(&ordinal) {
            let due = binding
                .failure
                .as_ref()
                .is_some_and(|f| f.retry_at <= now);
            let request = if due && binding.status == BindingStatus::Unbound {
                binding.attempts += 1;
                if let Some(failure) = binding.failure.as_mut() {
                    failure.retry_at = self.backoff.retry_at(now, binding.attempts);
                }
                info!(
                    "Claim {}: retrying provisioning (attempt {})",
                    binding.claim_name, binding.attempts
                );
                self.dirty.insert(ordinal);
                Some(ClaimRequest {
                    ordinal,
                    claim_name: binding.claim_name.clone(),
                    template: template.clone(),
                })
            } else {
                None
            };
            return Ensured {
                binding: binding.clone(),
                request,
            };
        }

        let binding = VolumeBinding {
            ordinal,
            claim_name: claim_name(&template.name, &self.set_name, ordinal),
            status: BindingStatus::Unbound,
            attached_to: None,
            attempts: 1,
            failure: None,
            created_at: now,
        };
        info!(
            "OrderedSet {}: allocated claim {} for ordinal {}",
            self.set_name, binding.claim_name, ordinal
        );
        let request = ClaimRequest {
            ordinal,
            claim_name: binding.claim_name.clone(),
            template: template.clone(),
        };
        self.bindings.insert(ordinal, binding.clone());
        self.dirty.insert(ordinal);
        Ensured {
            binding,
            request: Some(request),
        }
    }

    /// Apply a status report from the provisioner.
    pub fn observe(
        &mut self,
        ordinal: u32,
        event: &ClaimEvent,
        now: DateTime<Utc>,
    ) -> ControllerResult<()> {
        let binding = self
            .bindings
            .get_mut(&ordinal)
            .ok_or(ControllerError::UnknownOrdinal(ordinal))?;
        match event {
            ClaimEvent::Bound => {
                if binding.status != BindingStatus::Bound {
                    info!("Claim {}: Bound", binding.claim_name);
                }
                binding.status = BindingStatus::Bound;
                binding.failure = None;
            }
            ClaimEvent::Unbound => {
                binding.status = BindingStatus::Unbound;
            }
            ClaimEvent::ProvisioningFailed(reason) => {
                // A bound claim never becomes unbound through a late failure report
                if binding.status == BindingStatus::Bound {
                    debug!(
                        "Claim {}: ignoring failure report for bound claim",
                        binding.claim_name
                    );
                    return Ok(());
                }
                let retry_at = self.backoff.retry_at(now, binding.attempts);
                warn!(
                    "Claim {}: provisioning failed: {} (retry at {})",
                    binding.claim_name, reason, retry_at
                );
                binding.failure = Some(ProvisioningFailure {
                    reason: reason.clone(),
                    retry_at,
                });
            }
        }
        self.dirty.insert(ordinal);
        Ok(())
    }

    /// Mark the binding as used by instance `pod_ref`.
    pub fn attach(&mut self, ordinal: u32, pod_ref: &str) -> ControllerResult<VolumeBinding> {
        let binding = self
            .bindings
            .get_mut(&ordinal)
            .ok_or(ControllerError::UnknownOrdinal(ordinal))?;
        match binding.attached_to.as_deref() {
            Some(holder) if holder != pod_ref => Err(ControllerError::VolumeInUse {
                claim: binding.claim_name.clone(),
                holder: holder.to_string(),
                requester: pod_ref.to_string(),
            }),
            _ => {
                binding.attached_to = Some(pod_ref.to_string());
                self.dirty.insert(ordinal);
                Ok(binding.clone())
            }
        }
    }

    /// Detach the binding from whatever instance used it. Never deletes the claim.
    pub fn release(&mut self, ordinal: u32) -> Option<&VolumeBinding> {
        let binding = self.bindings.get_mut(&ordinal)?;
        if binding.attached_to.take().is_some() {
            debug!("Claim {}: released", binding.claim_name);
            self.dirty.insert(ordinal);
        }
        Some(binding)
    }

    pub fn lookup(&self, ordinal: u32) -> Option<&VolumeBinding> {
        self.bindings.get(&ordinal)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &VolumeBinding> {
        self.bindings.values()
    }

    /// Bindings changed since the last call, for checkpointing.
    /// Mark bindings dirty again after their records failed to persist.
    pub fn requeue(&mut self, ordinals: impl IntoIterator<Item = u32>) {
        self.dirty
            .extend(ordinals.into_iter().filter(|o| self.bindings.contains_key(o)));
    }

    pub fn take_dirty(&mut self) -> Vec<VolumeBinding> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|o| self.bindings.get(&o).cloned())
            .collect()
    }
}

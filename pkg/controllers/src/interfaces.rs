//! Narrow interfaces to the systems the controller drives.
//!
//! Implementations live outside this crate, except the in-memory ones in
//! [`crate::memory`].

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::reconciler::ReadinessSignal;
use pkg_types::orderedset::OrderedSet;
use pkg_types::pod::PodTemplate;
use pkg_types::volume::{ClaimEvent, VolumeBinding, VolumeClaimTemplate};

/// Instance returned by a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Runtime-assigned identifier, for logs only.
    pub id: String,
    pub address: String,
}

/// The instance is gone from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated;

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Start an instance named `name`. Fails if one with that name exists.
    async fn create_instance(
        &self,
        name: &str,
        template: &PodTemplate,
        binding: Option<&VolumeBinding>,
    ) -> Result<InstanceHandle>;

    /// Ask for the instance named `name` to be deleted. Deleting a missing
    /// instance succeeds. The call may return before the instance is gone;
    /// removal is reported through [`RuntimeDriver::watch_termination`].
    async fn delete_instance(&self, name: &str) -> Result<()>;

    /// Readiness changes of the current instance named `name`. Ends when
    /// the instance goes away.
    async fn watch_readiness(&self, name: &str) -> Result<BoxStream<'static, ReadinessSignal>>;

    /// Yields once when the current instance named `name` terminates.
    async fn watch_termination(&self, name: &str) -> Result<BoxStream<'static, Terminated>>;
}

#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Ask for a claim to be provisioned. Idempotent per claim name; the
    /// stream reports status changes until the claim is bound or fails.
    async fn create_claim(
        &self,
        claim_name: &str,
        template: &VolumeClaimTemplate,
    ) -> Result<BoxStream<'static, ClaimEvent>>;

    /// Explicit operator action. The controller never calls this.
    async fn delete_claim(&self, claim_name: &str) -> Result<()>;
}

#[async_trait]
pub trait DnsBackend: Send + Sync {
    async fn upsert_record(&self, fqdn: &str, address: &str) -> Result<()>;

    /// Record resolving to every address in `addresses`.
    async fn upsert_record_set(&self, fqdn: &str, addresses: &[String]) -> Result<()>;

    async fn delete_record(&self, fqdn: &str) -> Result<()>;
}

#[async_trait]
pub trait SpecSource: Send + Sync {
    /// Current and future desired states of one set. The stream ending
    /// means the set was deleted.
    async fn watch_spec(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, OrderedSet>>;
}

//! In-memory runtime, provisioner and DNS backends.
//!
//! These are not suitable for production use: nothing is persisted and no
//! real workload runs. They exist so the controller can be driven end to
//! end by tests and the demo binary, with hooks to inject readiness
//! changes, crashes and provisioning failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::ready;
use futures_util::stream::{self, BoxStream};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::interfaces::{
    DnsBackend, InstanceHandle, RuntimeDriver, Terminated, VolumeProvisioner,
};
use crate::reconciler::ReadinessSignal;
use pkg_types::pod::PodTemplate;
use pkg_types::volume::{ClaimEvent, VolumeBinding, VolumeClaimTemplate};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

// --- Runtime ---

#[derive(Debug, Clone, Default)]
struct InstanceState {
    readiness: Option<ReadinessSignal>,
    terminated: bool,
}

struct Instance {
    id: String,
    address: String,
    claim: Option<String>,
    /// Delete requested but not finished yet.
    deleting: bool,
    state: Arc<watch::Sender<InstanceState>>,
}

impl Instance {
    fn is_running(&self) -> bool {
        !self.state.borrow().terminated
    }
}

/// Runtime that keeps instances in a map.
///
/// With a ready delay, every instance reports `Ready` that long after it
/// was created; without one, readiness only changes through the hooks.
///
/// Deletes terminate the instance immediately unless the runtime was built
/// with [`MemoryRuntime::with_graceful_delete`]; then it keeps running until
/// [`MemoryRuntime::finish_termination`] is called.
#[derive(Default)]
pub struct MemoryRuntime {
    instances: RwLock<HashMap<String, Instance>>,
    ready_delay: Option<Duration>,
    graceful_delete: bool,
    failing_creates: RwLock<HashMap<String, String>>,
    created: RwLock<Vec<String>>,
    deleted: RwLock<Vec<String>>,
    refused: RwLock<Vec<String>>,
    next_id: AtomicU32,
}

impl MemoryRuntime {
    pub fn new(ready_delay: Option<Duration>) -> Self {
        Self {
            ready_delay,
            ..Self::default()
        }
    }

    pub fn with_graceful_delete(mut self) -> Self {
        self.graceful_delete = true;
        self
    }

    /// Names of created instances, in creation order.
    pub fn created(&self) -> Vec<String> {
        read(&self.created).clone()
    }

    /// Names passed to delete calls that hit a running instance, in call order.
    pub fn deleted(&self) -> Vec<String> {
        read(&self.deleted).clone()
    }

    /// Names of instances that have not terminated, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.instances)
            .iter()
            .filter(|(_, i)| i.is_running())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Running instances with a delete in progress, sorted.
    pub fn deleting(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.instances)
            .iter()
            .filter(|(_, i)| i.deleting && i.is_running())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Creates refused because the name or the claim was held by a running
    /// instance, as `"<name>: <reason>"`.
    pub fn refused(&self) -> Vec<String> {
        read(&self.refused).clone()
    }

    /// Complete a graceful delete of `name`.
    pub fn finish_termination(&self, name: &str) -> Result<()> {
        let instances = read(&self.instances);
        let instance = instances
            .get(name)
            .filter(|i| i.deleting && i.is_running())
            .ok_or_else(|| anyhow!("instance {} is not being deleted", name))?;
        debug!("[memory] {} terminated", name);
        instance.state.send_modify(|s| s.terminated = true);
        Ok(())
    }

    /// Claim the running instance `name` was started with.
    pub fn claim_of(&self, name: &str) -> Option<String> {
        read(&self.instances)
            .get(name)
            .filter(|i| i.is_running())
            .and_then(|i| i.claim.clone())
    }

    pub fn set_ready(&self, name: &str) -> Result<()> {
        self.set_readiness(name, ReadinessSignal::Ready)
    }

    pub fn set_not_ready(&self, name: &str) -> Result<()> {
        self.set_readiness(name, ReadinessSignal::NotReady)
    }

    /// The instance reports a startup or runtime failure but stays around.
    pub fn fail(&self, name: &str, reason: &str) -> Result<()> {
        self.set_readiness(name, ReadinessSignal::Failed(reason.to_string()))
    }

    /// The instance disappears without being asked to.
    pub fn crash(&self, name: &str) -> Result<()> {
        let instances = read(&self.instances);
        let instance = instances
            .get(name)
            .ok_or_else(|| anyhow!("instance {} not found", name))?;
        instance.state.send_modify(|s| s.terminated = true);
        Ok(())
    }

    /// Make every create of `name` fail until [`MemoryRuntime::heal_create`].
    pub fn fail_create(&self, name: &str, reason: &str) {
        write(&self.failing_creates).insert(name.to_string(), reason.to_string());
    }

    pub fn heal_create(&self, name: &str) {
        write(&self.failing_creates).remove(name);
    }

    fn set_readiness(&self, name: &str, signal: ReadinessSignal) -> Result<()> {
        let instances = read(&self.instances);
        let instance = instances
            .get(name)
            .filter(|i| i.is_running())
            .ok_or_else(|| anyhow!("instance {} not running", name))?;
        instance.state.send_modify(|s| s.readiness = Some(signal));
        Ok(())
    }

    fn state(&self, name: &str) -> Result<watch::Receiver<InstanceState>> {
        read(&self.instances)
            .get(name)
            .map(|i| i.state.subscribe())
            .ok_or_else(|| anyhow!("instance {} not found", name))
    }
}

#[async_trait]
impl RuntimeDriver for MemoryRuntime {
    async fn create_instance(
        &self,
        name: &str,
        template: &PodTemplate,
        binding: Option<&VolumeBinding>,
    ) -> Result<InstanceHandle> {
        if let Some(reason) = read(&self.failing_creates).get(name) {
            bail!("create {}: {}", name, reason);
        }
        let mut instances = write(&self.instances);
        let claim = binding.map(|b| b.claim_name.clone());
        let conflict = if instances.get(name).is_some_and(|i| i.is_running()) {
            Some(format!("instance {} already exists", name))
        } else {
            instances
                .iter()
                .find(|(_, i)| i.is_running() && claim.is_some() && i.claim == claim)
                .map(|(holder, _)| format!("claim in use by {}", holder))
        };
        if let Some(reason) = conflict {
            write(&self.refused).push(format!("{}: {}", name, reason));
            bail!("create {}: {}", name, reason);
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(watch::channel(InstanceState::default()).0);
        let instance = Instance {
            id: format!("mem-{}", n),
            address: format!("10.42.{}.{}", (n >> 8) & 0xff, n & 0xff),
            claim,
            deleting: false,
            state: state.clone(),
        };
        let handle = InstanceHandle {
            id: instance.id.clone(),
            address: instance.address.clone(),
        };
        debug!(
            "[memory] create {} ({}) at {}",
            name,
            template.primary_image(),
            handle.address
        );
        // Replacing a terminated instance ends its watch streams
        instances.insert(name.to_string(), instance);
        write(&self.created).push(name.to_string());

        if let Some(delay) = self.ready_delay {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                state.send_if_modified(|s| {
                    if s.terminated || s.readiness.is_some() {
                        return false;
                    }
                    s.readiness = Some(ReadinessSignal::Ready);
                    true
                });
            });
        }
        Ok(handle)
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        let mut instances = write(&self.instances);
        if let Some(instance) = instances.get_mut(name).filter(|i| i.is_running()) {
            debug!("[memory] delete {}", name);
            write(&self.deleted).push(name.to_string());
            if self.graceful_delete {
                instance.deleting = true;
            } else {
                instance.state.send_modify(|s| s.terminated = true);
            }
        }
        Ok(())
    }

    async fn watch_readiness(&self, name: &str) -> Result<BoxStream<'static, ReadinessSignal>> {
        let rx = self.state(name)?;
        Ok(WatchStream::new(rx)
            .take_while(|s| ready(!s.terminated))
            .filter_map(|s| ready(s.readiness))
            .boxed())
    }

    async fn watch_termination(&self, name: &str) -> Result<BoxStream<'static, Terminated>> {
        // Nothing to wait for if the instance never existed
        let Ok(rx) = self.state(name) else {
            return Ok(stream::iter([Terminated]).boxed());
        };
        Ok(WatchStream::new(rx)
            .filter(|s| ready(s.terminated))
            .map(|_| Terminated)
            .take(1)
            .boxed())
    }
}

// --- Provisioner ---

/// Provisioner that binds every claim immediately unless told to fail it.
#[derive(Default)]
pub struct MemoryProvisioner {
    claims: RwLock<BTreeMap<String, VolumeClaimTemplate>>,
    failing: RwLock<HashMap<String, String>>,
    requests: RwLock<Vec<String>>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request for `claim_name` with `reason`.
    pub fn fail_claim(&self, claim_name: &str, reason: &str) {
        write(&self.failing).insert(claim_name.to_string(), reason.to_string());
    }

    pub fn heal_claim(&self, claim_name: &str) {
        write(&self.failing).remove(claim_name);
    }

    /// Names of provisioned claims, sorted.
    pub fn claims(&self) -> Vec<String> {
        read(&self.claims).keys().cloned().collect()
    }

    /// Every create request received, in order, including repeats.
    pub fn requests(&self) -> Vec<String> {
        read(&self.requests).clone()
    }
}

#[async_trait]
impl VolumeProvisioner for MemoryProvisioner {
    async fn create_claim(
        &self,
        claim_name: &str,
        template: &VolumeClaimTemplate,
    ) -> Result<BoxStream<'static, ClaimEvent>> {
        write(&self.requests).push(claim_name.to_string());
        if let Some(reason) = read(&self.failing).get(claim_name) {
            let event = ClaimEvent::ProvisioningFailed(reason.clone());
            return Ok(stream::iter([event]).boxed());
        }
        write(&self.claims)
            .entry(claim_name.to_string())
            .or_insert_with(|| template.clone());
        Ok(stream::iter([ClaimEvent::Bound]).boxed())
    }

    async fn delete_claim(&self, claim_name: &str) -> Result<()> {
        write(&self.claims).remove(claim_name);
        Ok(())
    }
}

// --- DNS ---

/// DNS table: fqdn -> addresses.
#[derive(Default)]
pub struct MemoryDns {
    records: RwLock<BTreeMap<String, Vec<String>>>,
    unavailable: AtomicBool,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, fqdn: &str) -> Option<Vec<String>> {
        read(&self.records).get(fqdn).cloned()
    }

    /// Published names, sorted.
    pub fn names(&self) -> Vec<String> {
        read(&self.records).keys().cloned().collect()
    }

    /// While unavailable, every call fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("dns backend unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl DnsBackend for MemoryDns {
    async fn upsert_record(&self, fqdn: &str, address: &str) -> Result<()> {
        self.check()?;
        write(&self.records).insert(fqdn.to_string(), vec![address.to_string()]);
        Ok(())
    }

    async fn upsert_record_set(&self, fqdn: &str, addresses: &[String]) -> Result<()> {
        self.check()?;
        write(&self.records).insert(fqdn.to_string(), addresses.to_vec());
        Ok(())
    }

    async fn delete_record(&self, fqdn: &str) -> Result<()> {
        self.check()?;
        write(&self.records).remove(fqdn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pod::ContainerSpec;

    fn template() -> PodTemplate {
        PodTemplate {
            labels: Default::default(),
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                image: "busybox".to_string(),
                command: vec![],
                args: vec![],
                env: Default::default(),
                resources: Default::default(),
                volume_mounts: vec![],
            }],
            runtime: None,
        }
    }

    #[tokio::test]
    async fn test_runtime_readiness_and_termination() {
        let runtime = MemoryRuntime::new(None);
        runtime.create_instance("web-0", &template(), None).await.unwrap();
        assert!(runtime.create_instance("web-0", &template(), None).await.is_err());

        let mut readiness = runtime.watch_readiness("web-0").await.unwrap();
        let mut termination = runtime.watch_termination("web-0").await.unwrap();

        runtime.set_ready("web-0").unwrap();
        assert_eq!(readiness.next().await, Some(ReadinessSignal::Ready));

        runtime.delete_instance("web-0").await.unwrap();
        assert_eq!(termination.next().await, Some(Terminated));
        assert_eq!(readiness.next().await, None);
        assert_eq!(runtime.deleted(), vec!["web-0"]);
        assert!(runtime.running().is_empty());

        // Name can be reused once the old instance is gone
        runtime.create_instance("web-0", &template(), None).await.unwrap();
        assert_eq!(runtime.created(), vec!["web-0", "web-0"]);
    }

    #[tokio::test]
    async fn test_runtime_graceful_delete() {
        let runtime = MemoryRuntime::new(None).with_graceful_delete();
        let binding = VolumeBinding {
            ordinal: 0,
            claim_name: "data-web-0".to_string(),
            status: pkg_types::volume::BindingStatus::Bound,
            attached_to: None,
            attempts: 1,
            failure: None,
            created_at: chrono::Utc::now(),
        };
        runtime
            .create_instance("web-0", &template(), Some(&binding))
            .await
            .unwrap();
        let mut termination = runtime.watch_termination("web-0").await.unwrap();

        runtime.delete_instance("web-0").await.unwrap();
        assert_eq!(runtime.running(), vec!["web-0"]);
        assert_eq!(runtime.deleting(), vec!["web-0"]);

        // Neither the name nor the claim can be reused yet
        assert!(runtime.create_instance("web-0", &template(), None).await.is_err());
        assert!(
            runtime
                .create_instance("other-0", &template(), Some(&binding))
                .await
                .is_err()
        );
        assert_eq!(runtime.refused().len(), 2);

        runtime.finish_termination("web-0").unwrap();
        assert_eq!(termination.next().await, Some(Terminated));
        assert!(runtime.running().is_empty());
        assert!(runtime.finish_termination("web-0").is_err());
        runtime
            .create_instance("web-0", &template(), Some(&binding))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_instance_counts_as_terminated() {
        let runtime = MemoryRuntime::new(None);
        let mut termination = runtime.watch_termination("ghost-0").await.unwrap();
        assert_eq!(termination.next().await, Some(Terminated));
    }

    #[tokio::test]
    async fn test_runtime_auto_ready() {
        let runtime = MemoryRuntime::new(Some(Duration::from_millis(5)));
        runtime.create_instance("db-0", &template(), None).await.unwrap();
        let mut readiness = runtime.watch_readiness("db-0").await.unwrap();
        assert_eq!(readiness.next().await, Some(ReadinessSignal::Ready));
    }

    #[tokio::test]
    async fn test_provisioner_failure_and_heal() {
        let provisioner = MemoryProvisioner::new();
        let vct = VolumeClaimTemplate {
            name: "data".to_string(),
            storage_class: None,
            access_modes: vec![],
            requested_bytes: 0,
        };
        provisioner.fail_claim("data-db-0", "quota exceeded");
        let events: Vec<ClaimEvent> = provisioner
            .create_claim("data-db-0", &vct)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events,
            vec![ClaimEvent::ProvisioningFailed("quota exceeded".into())]
        );
        assert!(provisioner.claims().is_empty());

        provisioner.heal_claim("data-db-0");
        let events: Vec<ClaimEvent> = provisioner
            .create_claim("data-db-0", &vct)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events, vec![ClaimEvent::Bound]);
        assert_eq!(provisioner.claims(), vec!["data-db-0"]);
        assert_eq!(provisioner.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_dns_table() {
        let dns = MemoryDns::new();
        dns.upsert_record("a.svc", "10.0.0.1").await.unwrap();
        dns.upsert_record_set("svc", &["10.0.0.1".to_string()])
            .await
            .unwrap();
        assert_eq!(dns.resolve("a.svc"), Some(vec!["10.0.0.1".to_string()]));

        dns.set_unavailable(true);
        assert!(dns.delete_record("a.svc").await.is_err());
        dns.set_unavailable(false);
        dns.delete_record("a.svc").await.unwrap();
        assert_eq!(dns.names(), vec!["svc"]);
    }
}

use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::desired::DesiredState;
use crate::dns::DnsAction;
use crate::interfaces::{DnsBackend, RuntimeDriver, SpecSource, VolumeProvisioner};
use crate::reconciler::{Action, Observation, ReconcilerConfig, SetReconciler};
use pkg_constants::controller::{EVENT_CHANNEL_CAPACITY, RESYNC_INTERVAL_SECS};
use pkg_state::client::StateStore;
use pkg_types::orderedset::{OrderedSet, OrderedSetStatus};
use pkg_types::volume::ClaimEvent;

/// External systems a set controller drives.
#[derive(Clone)]
pub struct Backends {
    pub runtime: Arc<dyn RuntimeDriver>,
    pub provisioner: Arc<dyn VolumeProvisioner>,
    pub dns: Arc<dyn DnsBackend>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    pub reconciler: ReconcilerConfig,
    /// Pass interval when nothing happens; picks up expired backoffs.
    pub resync_interval: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            resync_interval: Duration::from_secs(RESYNC_INTERVAL_SECS),
        }
    }
}

/// Handle to a running set controller.
pub struct SetHandle {
    events: mpsc::Sender<Observation>,
    status: watch::Receiver<OrderedSetStatus>,
    task: JoinHandle<()>,
}

impl SetHandle {
    /// Latest status, updated after every pass.
    pub fn status(&self) -> watch::Receiver<OrderedSetStatus> {
        self.status.clone()
    }

    /// Delete the instance of one ordinal. The controller recreates it
    /// under the same name with the same storage.
    pub async fn delete_replica(&self, ordinal: u32) -> anyhow::Result<()> {
        self.events
            .send(Observation::DeleteRequested { ordinal })
            .await
            .map_err(|_| anyhow::anyhow!("set controller has exited"))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the controller to exit, which happens once the set was
    /// deleted and every instance is gone.
    pub async fn join(self) -> anyhow::Result<()> {
        self.task
            .await
            .map_err(|e| anyhow::anyhow!("set controller task failed: {}", e))
    }
}

/// Controller for a single ordered set: one tokio task that owns the set's
/// reconciler, executes its actions and feeds results back.
pub struct SetController {
    namespace: String,
    name: String,
    backends: Backends,
    specs: Arc<dyn SpecSource>,
    store: Option<StateStore>,
    options: ControllerOptions,
}

impl SetController {
    pub fn new(
        namespace: &str,
        name: &str,
        backends: Backends,
        specs: Arc<dyn SpecSource>,
        store: Option<StateStore>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            backends,
            specs,
            store,
            options,
        }
    }

    pub fn start(self) -> SetHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(OrderedSetStatus::default());
        let tx = events_tx.clone();
        let task = tokio::spawn(async move {
            let key = format!("{}/{}", self.namespace, self.name);
            info!(
                "SetController {} started (resync={}s)",
                key,
                self.options.resync_interval.as_secs()
            );
            match self.run(tx, events_rx, status_tx).await {
                Ok(()) => info!("SetController {} stopped", key),
                Err(e) => warn!("SetController {} exited: {}", key, e),
            }
        });
        SetHandle {
            events: events_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(
        self,
        events_tx: mpsc::Sender<Observation>,
        mut events_rx: mpsc::Receiver<Observation>,
        status_tx: watch::Sender<OrderedSetStatus>,
    ) -> anyhow::Result<()> {
        let mut specs = self.specs.watch_spec(&self.namespace, &self.name).await?;

        // A set cannot start from a rejected manifest; wait for a valid one.
        let desired = loop {
            let Some(set) = specs.next().await else {
                return Ok(());
            };
            match DesiredState::from_set(&set) {
                Ok(desired) => break desired,
                Err(e) => warn!("SetController {}/{}: {}", self.namespace, self.name, e),
            }
        };

        let checkpoint = self
            .store
            .clone()
            .map(|store| Checkpoint::new(store, &self.namespace, &self.name));
        let reconciler = match &checkpoint {
            Some(checkpoint) => {
                let (replicas, bindings) = checkpoint.load().await?;
                if !replicas.is_empty() || !bindings.is_empty() {
                    info!(
                        "SetController {}/{}: restored {} replicas, {} bindings",
                        self.namespace,
                        self.name,
                        replicas.len(),
                        bindings.len()
                    );
                }
                SetReconciler::restore(desired, self.options.reconciler, replicas, bindings)
            }
            None => SetReconciler::new(desired, self.options.reconciler),
        };

        let mut worker = Worker {
            key: format!("{}/{}", self.namespace, self.name),
            reconciler,
            backends: self.backends,
            events: events_tx,
            watchers: BTreeMap::new(),
            claims: BTreeMap::new(),
            checkpoint,
        };
        let resume = worker.reconciler.resume();
        worker.execute(resume).await;

        let mut resync = tokio::time::interval(self.options.resync_interval);
        let mut deleted = false;
        loop {
            if !deleted {
                deleted = worker.apply_latest_spec(&mut specs).await;
            }
            while let Ok(observation) = events_rx.try_recv() {
                worker.observe(observation).await;
            }

            let actions = worker.reconciler.reconcile(Utc::now());
            worker.execute(actions).await;
            worker.prune_watchers();
            worker.persist().await;
            status_tx.send_if_modified(|status| {
                let next = worker.reconciler.status();
                if *status == *next {
                    return false;
                }
                debug!(
                    "OrderedSet {}: {}/{} ready, {} updated",
                    worker.key, next.ready_replicas, next.replicas, next.updated_replicas
                );
                *status = next.clone();
                true
            });

            if deleted && worker.reconciler.is_drained() {
                info!("OrderedSet {}: all replicas gone", worker.key);
                worker.shutdown();
                return Ok(());
            }

            tokio::select! {
                spec = specs.next(), if !deleted => match spec {
                    Some(set) => worker.update_spec(&set).await,
                    None => {
                        worker.reconciler.begin_teardown();
                        deleted = true;
                    }
                },
                Some(observation) = events_rx.recv() => worker.observe(observation).await,
                _ = resync.tick() => {}
            }
        }
    }
}

struct InstanceWatch {
    uid: String,
    tasks: Vec<JoinHandle<()>>,
}

struct Worker {
    key: String,
    reconciler: SetReconciler,
    backends: Backends,
    events: mpsc::Sender<Observation>,
    watchers: BTreeMap<u32, InstanceWatch>,
    claims: BTreeMap<u32, JoinHandle<()>>,
    checkpoint: Option<Checkpoint>,
}

impl Worker {
    /// Apply every queued spec change, keeping only the effect of the
    /// latest. Returns true when the spec stream has ended.
    async fn apply_latest_spec(&mut self, specs: &mut BoxStream<'static, OrderedSet>) -> bool {
        let mut latest = None;
        let mut ended = false;
        while let Some(next) = specs.next().now_or_never() {
            match next {
                Some(set) => latest = Some(set),
                None => {
                    ended = true;
                    break;
                }
            }
        }
        if let Some(set) = latest {
            self.update_spec(&set).await;
        }
        if ended {
            self.reconciler.begin_teardown();
        }
        ended
    }

    async fn update_spec(&mut self, set: &OrderedSet) {
        // Rejections are reported through the InvalidSpec condition
        match self.reconciler.update_spec(set, Utc::now()) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => debug!("OrderedSet {}: {}", self.key, e),
        }
    }

    async fn observe(&mut self, observation: Observation) {
        let actions = self.reconciler.observe(observation, Utc::now());
        self.execute(actions).await;
    }

    /// Run actions to completion, feeding results back into the reconciler.
    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            let observation = match action {
                Action::CreateClaim(request) => {
                    match self
                        .backends
                        .provisioner
                        .create_claim(&request.claim_name, &request.template)
                        .await
                    {
                        Ok(stream) => {
                            self.forward_claim(request.ordinal, stream);
                            None
                        }
                        Err(e) => Some(Observation::Claim {
                            ordinal: request.ordinal,
                            event: ClaimEvent::ProvisioningFailed(e.to_string()),
                        }),
                    }
                }
                Action::CreateInstance {
                    ordinal,
                    name,
                    uid,
                    template,
                    binding,
                } => {
                    match self
                        .backends
                        .runtime
                        .create_instance(&name, &template, binding.as_ref())
                        .await
                    {
                        Ok(handle) => {
                            info!(
                                "OrderedSet {}: created replica {} (id={}, address={})",
                                self.key, name, handle.id, handle.address
                            );
                            Some(Observation::InstanceCreated {
                                ordinal,
                                uid,
                                address: handle.address,
                            })
                        }
                        Err(e) => Some(Observation::CreateFailed {
                            ordinal,
                            uid,
                            reason: e.to_string(),
                        }),
                    }
                }
                Action::DeleteInstance { ordinal, name, uid } => {
                    match self.backends.runtime.delete_instance(&name).await {
                        Ok(()) => {
                            // Gone only once the termination watch confirms it
                            info!("OrderedSet {}: deleting replica {}", self.key, name);
                            self.watch_instance(ordinal, name, uid);
                            None
                        }
                        Err(e) => Some(Observation::DeleteFailed {
                            ordinal,
                            uid,
                            reason: e.to_string(),
                        }),
                    }
                }
                Action::WatchInstance { ordinal, name, uid } => {
                    self.watch_instance(ordinal, name, uid);
                    None
                }
                Action::Dns(dns) => {
                    if let Err(e) = apply_dns(self.backends.dns.as_ref(), &dns).await {
                        warn!("OrderedSet {}: DNS update failed: {}", self.key, e);
                        if let DnsAction::Upsert { fqdn, .. } | DnsAction::UpsertSet { fqdn, .. } =
                            &dns
                        {
                            self.reconciler.forget_dns(fqdn);
                        }
                    }
                    None
                }
            };
            if let Some(observation) = observation {
                queue.extend(self.reconciler.observe(observation, Utc::now()));
            }
        }
    }

    fn forward_claim(&mut self, ordinal: u32, mut stream: BoxStream<'static, ClaimEvent>) {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if events
                    .send(Observation::Claim { ordinal, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        if let Some(previous) = self.claims.insert(ordinal, task) {
            previous.abort();
        }
    }

    fn watch_instance(&mut self, ordinal: u32, name: String, uid: String) {
        if self
            .watchers
            .get(&ordinal)
            .is_some_and(|w| w.uid == uid && w.tasks.iter().any(|t| !t.is_finished()))
        {
            return;
        }
        if let Some(previous) = self.watchers.remove(&ordinal) {
            previous.tasks.iter().for_each(|t| t.abort());
        }
        debug!("OrderedSet {}: watching {} ({})", self.key, name, uid);

        let readiness = {
            let runtime = self.backends.runtime.clone();
            let events = self.events.clone();
            let (name, uid) = (name.clone(), uid.clone());
            tokio::spawn(async move {
                let mut stream = match runtime.watch_readiness(&name).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Replica {}: cannot watch readiness: {}", name, e);
                        return;
                    }
                };
                while let Some(signal) = stream.next().await {
                    let observation = Observation::Readiness {
                        ordinal,
                        uid: uid.clone(),
                        signal,
                    };
                    if events.send(observation).await.is_err() {
                        break;
                    }
                }
            })
        };
        let termination = {
            let runtime = self.backends.runtime.clone();
            let events = self.events.clone();
            let (name, uid) = (name.clone(), uid.clone());
            tokio::spawn(async move {
                let mut stream = match runtime.watch_termination(&name).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Replica {}: cannot watch termination: {}", name, e);
                        // A pending delete is retried, which re-arms the watch
                        let reason = format!("cannot watch termination: {}", e);
                        let _ = events
                            .send(Observation::DeleteFailed { ordinal, uid, reason })
                            .await;
                        return;
                    }
                };
                if stream.next().await.is_some() {
                    let _ = events.send(Observation::Terminated { ordinal, uid }).await;
                }
            })
        };
        self.watchers.insert(
            ordinal,
            InstanceWatch {
                uid,
                tasks: vec![readiness, termination],
            },
        );
    }

    /// Stop watching instances the reconciler no longer tracks.
    fn prune_watchers(&mut self) {
        let reconciler = &self.reconciler;
        self.watchers.retain(|ordinal, watch| {
            let live = reconciler
                .replica(*ordinal)
                .is_some_and(|r| r.has_instance() && r.pod_ref.as_deref() == Some(&watch.uid));
            if !live {
                watch.tasks.iter().for_each(|t| t.abort());
            }
            live
        });
        self.claims.retain(|_, task| !task.is_finished());
    }

    async fn persist(&mut self) {
        let changes = self.reconciler.take_changes();
        let Some(checkpoint) = &self.checkpoint else {
            return;
        };
        if changes.is_empty() {
            return;
        }
        if let Err(e) = checkpoint.save(&changes).await {
            warn!("OrderedSet {}: checkpoint failed, will retry: {}", self.key, e);
            self.reconciler.requeue_changes(changes);
        }
    }

    fn shutdown(&mut self) {
        for (_, watch) in std::mem::take(&mut self.watchers) {
            watch.tasks.iter().for_each(|t| t.abort());
        }
        for (_, task) in std::mem::take(&mut self.claims) {
            task.abort();
        }
    }
}

async fn apply_dns(backend: &dyn DnsBackend, action: &DnsAction) -> anyhow::Result<()> {
    match action {
        DnsAction::Upsert { fqdn, address } => backend.upsert_record(fqdn, address).await,
        DnsAction::UpsertSet { fqdn, addresses } => {
            backend.upsert_record_set(fqdn, addresses).await
        }
        DnsAction::Delete { fqdn } => backend.delete_record(fqdn).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::memory::{MemoryDns, MemoryProvisioner, MemoryRuntime};
    use async_trait::async_trait;
    use pkg_types::orderedset::{ConditionKind, ManagementPolicy, OrderedSetSpec, RestartPolicy};
    use pkg_types::pod::{ContainerSpec, PodTemplate};
    use pkg_types::volume::{AccessMode, VolumeClaimTemplate};
    use tokio::sync::Mutex;
    use tokio_stream::wrappers::ReceiverStream;

    /// Spec source fed by the test through a channel; dropping the sender
    /// deletes the set.
    struct ChannelSpecs {
        rx: Mutex<Option<mpsc::Receiver<OrderedSet>>>,
    }

    #[async_trait]
    impl SpecSource for ChannelSpecs {
        async fn watch_spec(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> anyhow::Result<BoxStream<'static, OrderedSet>> {
            let rx = self
                .rx
                .lock()
                .await
                .take()
                .ok_or_else(|| anyhow::anyhow!("spec stream already taken"))?;
            Ok(ReceiverStream::new(rx).boxed())
        }
    }

    fn make_set(replicas: i32) -> OrderedSet {
        OrderedSet {
            name: "web".to_string(),
            namespace: "default".to_string(),
            generation: 1,
            spec: OrderedSetSpec {
                replicas,
                template: PodTemplate {
                    labels: Default::default(),
                    containers: vec![ContainerSpec {
                        name: "nginx".to_string(),
                        image: "nginx:1.27".to_string(),
                        command: vec![],
                        args: vec![],
                        env: Default::default(),
                        resources: Default::default(),
                        volume_mounts: vec![],
                    }],
                    runtime: None,
                },
                volume_claim_template: Some(VolumeClaimTemplate {
                    name: "data".to_string(),
                    storage_class: None,
                    access_modes: vec![AccessMode::ReadWriteOnce],
                    requested_bytes: 1 << 20,
                }),
                service_name: "nginx".to_string(),
                update_partition: 0,
                management_policy: ManagementPolicy::Ordered,
                restart_policy: RestartPolicy::Always,
            },
            status: Default::default(),
        }
    }

    fn options() -> ControllerOptions {
        ControllerOptions {
            reconciler: ReconcilerConfig {
                stall_threshold: Duration::from_secs(60),
                backoff: Backoff {
                    base: Duration::from_millis(20),
                    max: Duration::from_millis(200),
                },
            },
            resync_interval: Duration::from_millis(20),
        }
    }

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        provisioner: Arc<MemoryProvisioner>,
        dns: Arc<MemoryDns>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                runtime: Arc::new(MemoryRuntime::new(Some(Duration::from_millis(5)))),
                provisioner: Arc::new(MemoryProvisioner::new()),
                dns: Arc::new(MemoryDns::new()),
            }
        }

        /// Deleted instances keep running until the test finishes them.
        fn graceful() -> Self {
            Self {
                runtime: Arc::new(
                    MemoryRuntime::new(Some(Duration::from_millis(5))).with_graceful_delete(),
                ),
                ..Self::new()
            }
        }

        fn start(&self, store: Option<StateStore>) -> (mpsc::Sender<OrderedSet>, SetHandle) {
            let (tx, rx) = mpsc::channel(8);
            let backends = Backends {
                runtime: self.runtime.clone(),
                provisioner: self.provisioner.clone(),
                dns: self.dns.clone(),
            };
            let specs = Arc::new(ChannelSpecs {
                rx: Mutex::new(Some(rx)),
            });
            let handle =
                SetController::new("default", "web", backends, specs, store, options()).start();
            (tx, handle)
        }
    }

    async fn wait_status(handle: &SetHandle, check: impl Fn(&OrderedSetStatus) -> bool) {
        let mut status = handle.status();
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if check(&*status.borrow_and_update()) {
                    return;
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(waited.is_ok(), "status never matched: {:?}", *status.borrow());
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn wait_ready(handle: &SetHandle, n: u32) {
        wait_status(handle, |s| s.ready_replicas == n && s.replicas == n).await;
    }

    #[tokio::test]
    async fn test_scale_up_publishes_dns() {
        let f = Fixture::new();
        let (tx, handle) = f.start(None);
        tx.send(make_set(3)).await.unwrap();

        wait_ready(&handle, 3).await;
        assert_eq!(f.runtime.created(), vec!["web-0", "web-1", "web-2"]);
        assert_eq!(f.runtime.claim_of("web-2").as_deref(), Some("data-web-2"));
        assert!(f.dns.resolve("web-1.nginx.default.svc.cluster.local").is_some());
        let mut aggregate = f.dns.resolve("nginx.default.svc.cluster.local").unwrap();
        aggregate.sort();
        let mut addresses: Vec<String> = ["web-0", "web-1", "web-2"]
            .iter()
            .filter_map(|n| f.dns.resolve(&format!("{}.nginx.default.svc.cluster.local", n)))
            .flatten()
            .collect();
        addresses.sort();
        assert_eq!(aggregate, addresses);
        handle.abort();
    }

    #[tokio::test]
    async fn test_deleted_replica_recreated_with_same_claim() {
        let f = Fixture::new();
        let (tx, handle) = f.start(None);
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;

        handle.delete_replica(1).await.unwrap();
        eventually("web-1 to be recreated", || f.runtime.created().len() == 3).await;
        wait_ready(&handle, 2).await;

        assert_eq!(f.runtime.created(), vec!["web-0", "web-1", "web-1"]);
        assert_eq!(f.runtime.deleted(), vec!["web-1"]);
        assert_eq!(f.runtime.claim_of("web-1").as_deref(), Some("data-web-1"));
        assert_eq!(f.provisioner.claims(), vec!["data-web-0", "data-web-1"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_crash_restarts_in_place() {
        let f = Fixture::new();
        let (tx, handle) = f.start(None);
        tx.send(make_set(1)).await.unwrap();
        wait_ready(&handle, 1).await;

        f.runtime.crash("web-0").unwrap();
        eventually("web-0 to be recreated", || f.runtime.created().len() == 2).await;
        wait_ready(&handle, 1).await;
        assert_eq!(f.runtime.created(), vec!["web-0", "web-0"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_provisioning_failure_blocks_then_heals() {
        let f = Fixture::new();
        f.provisioner.fail_claim("data-web-1", "quota exceeded");
        let (tx, handle) = f.start(None);
        tx.send(make_set(3)).await.unwrap();

        wait_status(&handle, |s| {
            s.condition(ConditionKind::ProvisioningFailed)
                .is_some_and(|c| c.ordinal == Some(1))
        })
        .await;
        assert_eq!(f.runtime.created(), vec!["web-0"]);

        f.provisioner.heal_claim("data-web-1");
        wait_ready(&handle, 3).await;
        assert!(f.provisioner.requests().len() >= 4);
        assert!(handle.status().borrow().conditions.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_spec_update_scales_down() {
        let f = Fixture::new();
        let (tx, handle) = f.start(None);
        tx.send(make_set(3)).await.unwrap();
        wait_ready(&handle, 3).await;

        let mut smaller = make_set(1);
        smaller.generation = 2;
        tx.send(smaller).await.unwrap();
        wait_ready(&handle, 1).await;

        assert_eq!(f.runtime.deleted(), vec!["web-2", "web-1"]);
        assert_eq!(f.runtime.running(), vec!["web-0"]);
        assert_eq!(handle.status().borrow().observed_generation, 2);
        assert!(f.dns.resolve("web-2.nginx.default.svc.cluster.local").is_none());
        // Claims outlive their replicas
        assert_eq!(f.provisioner.claims().len(), 3);
        handle.abort();
    }

    #[tokio::test]
    async fn test_invalid_spec_keeps_previous() {
        let f = Fixture::new();
        let (tx, handle) = f.start(None);
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;

        let mut bad = make_set(-1);
        bad.generation = 2;
        tx.send(bad).await.unwrap();
        wait_status(&handle, |s| s.condition(ConditionKind::InvalidSpec).is_some()).await;
        assert_eq!(f.runtime.running(), vec!["web-0", "web-1"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_deleted_set_drains_and_exits() {
        let f = Fixture::new();
        let (tx, handle) = f.start(None);
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.runtime.deleted(), vec!["web-1", "web-0"]);
        assert!(f.runtime.running().is_empty());
        assert!(f.dns.names().is_empty());
    }

    #[tokio::test]
    async fn test_restart_resumes_from_checkpoint() {
        let f = Fixture::new();
        let store = StateStore::in_memory();
        let (tx, handle) = f.start(Some(store.clone()));
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;
        handle.abort();
        drop(tx);

        let (tx, handle) = f.start(Some(store));
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;

        // Running instances were adopted, not recreated
        assert_eq!(f.runtime.created(), vec!["web-0", "web-1"]);
        assert_eq!(f.provisioner.requests().len(), 2);

        // And are still watched
        f.runtime.crash("web-0").unwrap();
        eventually("web-0 to be recreated", || f.runtime.created().len() == 3).await;
        wait_ready(&handle, 2).await;
        assert_eq!(f.runtime.created(), vec!["web-0", "web-1", "web-0"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_scale_down_waits_for_termination() {
        let f = Fixture::graceful();
        let (tx, handle) = f.start(None);
        tx.send(make_set(3)).await.unwrap();
        wait_ready(&handle, 3).await;

        let mut smaller = make_set(1);
        smaller.generation = 2;
        tx.send(smaller).await.unwrap();
        eventually("web-2 delete", || f.runtime.deleting() == vec!["web-2"]).await;

        // Several passes go by while web-2 is still running
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.runtime.deleted(), vec!["web-2"]);
        assert_eq!(handle.status().borrow().replicas, 3);

        f.runtime.finish_termination("web-2").unwrap();
        eventually("web-1 delete", || f.runtime.deleting() == vec!["web-1"]).await;
        assert_eq!(f.runtime.deleted(), vec!["web-2", "web-1"]);

        f.runtime.finish_termination("web-1").unwrap();
        wait_ready(&handle, 1).await;
        assert_eq!(f.runtime.running(), vec!["web-0"]);
        handle.abort();
    }

    #[tokio::test]
    async fn test_recreate_waits_for_claim_release() {
        let f = Fixture::graceful();
        let (tx, handle) = f.start(None);
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;

        handle.delete_replica(1).await.unwrap();
        eventually("web-1 delete", || f.runtime.deleting() == vec!["web-1"]).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.runtime.created(), vec!["web-0", "web-1"]);

        f.runtime.finish_termination("web-1").unwrap();
        eventually("web-1 to be recreated", || f.runtime.created().len() == 3).await;
        wait_ready(&handle, 2).await;
        assert_eq!(f.runtime.claim_of("web-1").as_deref(), Some("data-web-1"));
        // No create was ever attempted against a held name or claim
        assert!(f.runtime.refused().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_checkpoint_retried_after_store_failure() {
        let f = Fixture::new();
        let store = StateStore::in_memory();
        store.set_read_only(true);
        let (tx, handle) = f.start(Some(store.clone()));
        tx.send(make_set(2)).await.unwrap();
        wait_ready(&handle, 2).await;

        let bindings_prefix = "/registry/volumebindings/default/web/";
        assert!(store.list_prefix(bindings_prefix).await.unwrap().is_empty());

        store.set_read_only(false);
        let mut saved = 0;
        for _ in 0..500 {
            saved = store.list_prefix(bindings_prefix).await.unwrap().len();
            if saved == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saved, 2);
        let replicas = store
            .list_prefix("/registry/replicas/default/web/")
            .await
            .unwrap();
        assert_eq!(replicas.len(), 2);
        handle.abort();
    }
}

//! Reconciler core for one ordered set.
//!
//! `SetReconciler` owns the replica arena, the storage binder and the DNS
//! registrar of a single set. It performs no I/O: observations from the
//! outside world are fed in through [`SetReconciler::observe`], and each
//! pass of [`SetReconciler::reconcile`] returns the [`Action`]s the driver
//! must execute. A pass runs, in order:
//!
//! 1. restart failed replicas whose backoff expired
//! 2. fill missing slots in `[0, N)` and drop unused ones above it
//! 3. re-issue deletes that failed earlier
//! 4. scale down
//! 5. roll one outdated replica
//! 6. scale up
//! 7. recompute conditions
//! 8. sync DNS with the ready set
//! 9. recompute status

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::binder::{ClaimRequest, StorageBinder};
use crate::desired::DesiredState;
use crate::dns::{DnsAction, DnsRegistrar};
use crate::error::{ControllerError, ControllerResult};
use crate::replica::{Replica, Transition};
use pkg_constants::controller::{STALL_THRESHOLD_SECS, TRANSITION_JOURNAL_CAPACITY};
use pkg_types::dns::DnsRecord;
use pkg_types::orderedset::{
    ConditionKind, ManagementPolicy, OrderedSet, OrderedSetStatus, ReplicaPhase, RestartPolicy,
    SetCondition, TerminationCause,
};
use pkg_types::pod::PodTemplate;
use pkg_types::volume::{BindingStatus, ClaimEvent, VolumeBinding};


// --- Actions and observations ---

/// Side effect requested by a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CreateClaim(ClaimRequest),
    CreateInstance {
        ordinal: u32,
        name: String,
        uid: String,
        template: PodTemplate,
        binding: Option<VolumeBinding>,
    },
    DeleteInstance {
        ordinal: u32,
        name: String,
        uid: String,
    },
    /// Start forwarding readiness and termination signals of an instance.
    WatchInstance {
        ordinal: u32,
        name: String,
        uid: String,
    },
    Dns(DnsAction),
}

/// Readiness report for a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessSignal {
    Ready,
    NotReady,
    Failed(String),
}

/// Something the driver learned from the outside world.
///
/// Instance-scoped observations carry the uid the instance was created
/// with; observations about an older instance of the same ordinal are
/// dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    InstanceCreated {
        ordinal: u32,
        uid: String,
        address: String,
    },
    CreateFailed {
        ordinal: u32,
        uid: String,
        reason: String,
    },
    Readiness {
        ordinal: u32,
        uid: String,
        signal: ReadinessSignal,
    },
    Terminated {
        ordinal: u32,
        uid: String,
    },
    /// Operator asked for the instance of `ordinal` to be deleted.
    DeleteRequested { ordinal: u32 },
    DeleteFailed {
        ordinal: u32,
        uid: String,
        reason: String,
    },
    Claim { ordinal: u32, event: ClaimEvent },
}

/// Tunables of the reconciler core.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// How long the blocking ordinal of an Ordered set may stay put before
    /// `StalledOrdering` is reported.
    pub stall_threshold: Duration,
    pub backoff: Backoff,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stall_threshold: Duration::from_secs(STALL_THRESHOLD_SECS),
            backoff: Backoff::default(),
        }
    }
}

/// Records changed since the last checkpoint.
#[derive(Debug, Default)]
pub struct Changes {
    pub replicas: Vec<Replica>,
    /// Ordinals whose slot was removed from the arena.
    pub removed: Vec<u32>,
    pub bindings: Vec<VolumeBinding>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty() && self.removed.is_empty() && self.bindings.is_empty()
    }
}

// --- Reconciler ---

pub struct SetReconciler {
    desired: DesiredState,
    config: ReconcilerConfig,
    replicas: BTreeMap<u32, Replica>,
    binder: StorageBinder,
    dns: DnsRegistrar,
    status: OrderedSetStatus,
    /// Condition describing the last rejected desired state, if any.
    rejected: Option<SetCondition>,
    journal: VecDeque<Transition>,
    dirty: BTreeSet<u32>,
    removed: BTreeSet<u32>,
}

impl SetReconciler {
    pub fn new(desired: DesiredState, config: ReconcilerConfig) -> Self {
        Self::restore(desired, config, Vec::new(), Vec::new())
    }

    /// Rebuild from checkpointed replicas and bindings.
    pub fn restore(
        desired: DesiredState,
        config: ReconcilerConfig,
        replicas: Vec<Replica>,
        bindings: Vec<VolumeBinding>,
    ) -> Self {
        let binder = StorageBinder::restore(&desired.set_name, config.backoff, bindings);
        let dns = DnsRegistrar::new(&desired.service_name, &desired.namespace);
        Self {
            binder,
            dns,
            config,
            replicas: replicas.into_iter().map(|r| (r.ordinal, r)).collect(),
            status: OrderedSetStatus::default(),
            rejected: None,
            journal: VecDeque::new(),
            dirty: BTreeSet::new(),
            removed: BTreeSet::new(),
            desired,
        }
    }

    pub fn desired(&self) -> &DesiredState {
        &self.desired
    }

    pub fn status(&self) -> &OrderedSetStatus {
        &self.status
    }

    pub fn replica(&self, ordinal: u32) -> Option<&Replica> {
        self.replicas.get(&ordinal)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    pub fn binding(&self, ordinal: u32) -> Option<&VolumeBinding> {
        self.binder.lookup(ordinal)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &VolumeBinding> {
        self.binder.bindings()
    }

    pub fn dns_records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.dns.records()
    }

    /// Drop a record whose backend call failed; the next pass re-issues it.
    pub fn forget_dns(&mut self, fqdn: &str) {
        self.dns.forget(fqdn);
    }

    /// Most recent phase changes, oldest first.
    pub fn journal(&self) -> impl Iterator<Item = &Transition> {
        self.journal.iter()
    }

    /// Replace the desired state.
    ///
    /// An invalid manifest is rejected as a whole: the previous desired
    /// state stays in force and an `InvalidSpec` condition is reported.
    pub fn update_spec(
        &mut self,
        set: &OrderedSet,
        now: DateTime<Utc>,
    ) -> ControllerResult<Vec<Action>> {
        let desired = DesiredState::from_set(set).and_then(|d| {
            if d.set_name != self.desired.set_name || d.namespace != self.desired.namespace {
                Err(ControllerError::invalid_spec(
                    &set.name,
                    "name and namespace cannot change",
                ))
            } else {
                Ok(d)
            }
        });
        let desired = match desired {
            Ok(d) => d,
            Err(e) => {
                warn!("OrderedSet {}: rejected update: {}", self.desired.set_name, e);
                self.rejected = Some(SetCondition {
                    kind: ConditionKind::InvalidSpec,
                    ordinal: None,
                    message: e.to_string(),
                    since: now,
                });
                return Err(e);
            }
        };

        self.rejected = None;
        if desired.replicas != self.desired.replicas {
            info!(
                "OrderedSet {}: scaling {} -> {}",
                desired.set_name, self.desired.replicas, desired.replicas
            );
        }
        if desired.revision != self.desired.revision {
            info!(
                "OrderedSet {}: template changed, revision {} ({})",
                desired.set_name,
                desired.revision,
                desired.template.primary_image()
            );
        }
        let actions = self
            .dns
            .rename_service(&desired.service_name)
            .into_iter()
            .map(Action::Dns)
            .collect();
        self.desired = desired;
        Ok(actions)
    }

    /// Scale to zero for set deletion. Bindings are kept.
    pub fn begin_teardown(&mut self) {
        info!(
            "OrderedSet {}: desired state removed, scaling to 0",
            self.desired.set_name
        );
        self.desired.replicas = 0;
    }

    /// No instance is left.
    pub fn is_drained(&self) -> bool {
        self.replicas.values().all(|r| r.phase == ReplicaPhase::Gone)
    }

    /// Actions needed to pick up where a previous controller left off:
    /// watch live instances, finish outstanding deletes and re-request
    /// claims that never reported back.
    pub fn resume(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        for replica in self.replicas.values() {
            let Some(uid) = replica.pod_ref.clone() else {
                continue;
            };
            if !replica.has_instance() {
                continue;
            }
            actions.push(Action::WatchInstance {
                ordinal: replica.ordinal,
                name: replica.name.clone(),
                uid: uid.clone(),
            });
            if replica.phase.is_terminating() {
                actions.push(Action::DeleteInstance {
                    ordinal: replica.ordinal,
                    name: replica.name.clone(),
                    uid,
                });
            }
        }
        if let Some(template) = &self.desired.volume_template {
            for binding in self.binder.bindings() {
                if binding.status == BindingStatus::Unbound && binding.failure.is_none() {
                    actions.push(Action::CreateClaim(ClaimRequest {
                        ordinal: binding.ordinal,
                        claim_name: binding.claim_name.clone(),
                        template: template.clone(),
                    }));
                }
            }
        }
        actions
    }

    /// Drain the records changed since the last call.
    pub fn take_changes(&mut self) -> Changes {
        let replicas = std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|o| self.replicas.get(&o).cloned())
            .collect();
        Changes {
            replicas,
            removed: std::mem::take(&mut self.removed).into_iter().collect(),
            bindings: self.binder.take_dirty(),
        }
    }

    /// Hand back changes that could not be saved; the next
    /// [`SetReconciler::take_changes`] returns them again, merged with
    /// anything changed since.
    pub fn requeue_changes(&mut self, changes: Changes) {
        for ordinal in changes.removed {
            // A slot recreated since then has a record to write, not delete
            if self.replicas.contains_key(&ordinal) {
                self.dirty.insert(ordinal);
            } else {
                self.removed.insert(ordinal);
            }
        }
        for replica in changes.replicas {
            if self.replicas.contains_key(&replica.ordinal) {
                self.dirty.insert(replica.ordinal);
            } else {
                self.removed.insert(replica.ordinal);
            }
        }
        self.binder
            .requeue(changes.bindings.into_iter().map(|b| b.ordinal));
    }

    // --- Observations ---

    /// Apply one observation. Returns the actions it makes immediately
    /// necessary; ordering decisions wait for the next pass.
    pub fn observe(&mut self, observation: Observation, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = Vec::new();
        match observation {
            Observation::InstanceCreated {
                ordinal,
                uid,
                address,
            } => {
                if !self.is_current(ordinal, &uid) {
                    return actions;
                }
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    debug!("Replica {}: instance {} at {}", replica.name, uid, address);
                    replica.address = Some(address);
                    actions.push(Action::WatchInstance {
                        ordinal,
                        name: replica.name.clone(),
                        uid,
                    });
                    self.dirty.insert(ordinal);
                }
            }
            Observation::CreateFailed {
                ordinal,
                uid,
                reason,
            } => {
                if !self.is_current(ordinal, &uid) {
                    return actions;
                }
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    replica.pod_ref = None;
                }
                self.fail(ordinal, reason, now, &mut actions);
            }
            Observation::Readiness {
                ordinal,
                uid,
                signal,
            } => {
                if !self.is_current(ordinal, &uid) {
                    return actions;
                }
                self.apply_readiness(ordinal, signal, now, &mut actions);
            }
            Observation::Terminated { ordinal, uid } => {
                if !self.is_current(ordinal, &uid) {
                    return actions;
                }
                let Some(phase) = self.replicas.get(&ordinal).map(|r| r.phase.clone()) else {
                    return actions;
                };
                if !phase.is_terminating() {
                    info!(
                        "OrderedSet {}: instance of ordinal {} terminated unexpectedly",
                        self.desired.set_name, ordinal
                    );
                    if !self.apply_transition(
                        ordinal,
                        ReplicaPhase::Terminating(TerminationCause::External),
                        now,
                        &mut actions,
                    ) {
                        return actions;
                    }
                }
                self.apply_transition(ordinal, ReplicaPhase::Gone, now, &mut actions);
            }
            Observation::DeleteRequested { ordinal } => {
                let deletable = self.replicas.get(&ordinal).is_some_and(|r| {
                    matches!(
                        r.phase,
                        ReplicaPhase::Creating | ReplicaPhase::Ready | ReplicaPhase::Failed(_)
                    )
                });
                if deletable {
                    self.begin_termination(ordinal, TerminationCause::External, now, &mut actions);
                }
            }
            Observation::DeleteFailed {
                ordinal,
                uid,
                reason,
            } => {
                if !self.is_current(ordinal, &uid) {
                    return actions;
                }
                let retry_at = self.config.backoff.retry_at(now, 1);
                if let Some(replica) = self
                    .replicas
                    .get_mut(&ordinal)
                    .filter(|r| r.phase.is_terminating())
                {
                    warn!(
                        "Replica {}: delete failed: {} (retry at {})",
                        replica.name, reason, retry_at
                    );
                    replica.retry_at = Some(retry_at);
                    self.dirty.insert(ordinal);
                }
            }
            Observation::Claim { ordinal, event } => {
                if let Err(e) = self.binder.observe(ordinal, &event, now) {
                    debug!("OrderedSet {}: claim event dropped: {}", self.desired.set_name, e);
                }
            }
        }
        actions
    }

    fn is_current(&self, ordinal: u32, uid: &str) -> bool {
        let current = self
            .replicas
            .get(&ordinal)
            .is_some_and(|r| r.pod_ref.as_deref() == Some(uid));
        if !current {
            debug!(
                "OrderedSet {}: ignoring event for stale instance {} of ordinal {}",
                self.desired.set_name, uid, ordinal
            );
        }
        current
    }

    fn apply_readiness(
        &mut self,
        ordinal: u32,
        signal: ReadinessSignal,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let Some(phase) = self.replicas.get(&ordinal).map(|r| r.phase.clone()) else {
            return;
        };
        match signal {
            ReadinessSignal::Ready => {
                if phase == ReplicaPhase::Creating
                    && !self.apply_transition(ordinal, ReplicaPhase::Ready, now, actions)
                {
                    return;
                }
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    if replica.phase != ReplicaPhase::Ready {
                        return;
                    }
                    replica.observed_ready = true;
                    replica.last_failure = None;
                    self.dirty.insert(ordinal);
                    actions.extend(self.dns.publish(replica).into_iter().map(Action::Dns));
                }
            }
            ReadinessSignal::NotReady => {
                if let Some(replica) = self.replicas.get_mut(&ordinal) {
                    if replica.observed_ready {
                        debug!("Replica {}: not ready", replica.name);
                        replica.observed_ready = false;
                        self.dirty.insert(ordinal);
                        actions.extend(self.dns.retract(ordinal).into_iter().map(Action::Dns));
                    }
                }
            }
            ReadinessSignal::Failed(reason) => {
                if matches!(phase, ReplicaPhase::Creating | ReplicaPhase::Ready) {
                    self.fail(ordinal, reason, now, actions);
                }
            }
        }
    }

    fn fail(&mut self, ordinal: u32, reason: String, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let Some(replica) = self.replicas.get_mut(&ordinal) else {
            return;
        };
        replica.restart_count += 1;
        let retry_at = self.config.backoff.retry_at(now, replica.restart_count);
        replica.retry_at = Some(retry_at);
        replica.last_failure = Some(reason.clone());
        warn!(
            "Replica {}: failed: {} (restarts={}, retry at {})",
            replica.name, reason, replica.restart_count, retry_at
        );
        self.apply_transition(ordinal, ReplicaPhase::Failed(reason), now, actions);
    }

    // --- Pass ---

    /// Run one reconcile pass against the current desired state.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        let mut actions = Vec::new();
        self.restart_failed(now, &mut actions);
        self.fill_slots(now, &mut actions);
        self.retry_deletes(now, &mut actions);
        let deleting = self.scale_down(now, &mut actions);
        if !deleting {
            self.roll_update(now, &mut actions);
        }
        self.scale_up(now, &mut actions);
        self.refresh_conditions(now);
        actions.extend(
            self.dns
                .sync(self.replicas.values())
                .into_iter()
                .map(Action::Dns),
        );
        self.refresh_status();
        actions
    }

    fn restart_failed(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        if self.desired.restart_policy != RestartPolicy::Always {
            return;
        }
        let due: Vec<u32> = self
            .replicas
            .range(..self.desired.replicas)
            .filter(|(_, r)| r.phase.is_failed() && r.retry_at.is_none_or(|t| t <= now))
            .map(|(o, _)| *o)
            .collect();
        for ordinal in due {
            self.begin_termination(ordinal, TerminationCause::Restart, now, actions);
        }
    }

    fn fill_slots(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let n = self.desired.replicas;
        for ordinal in 0..n {
            match self.replicas.get(&ordinal).map(|r| r.phase == ReplicaPhase::Gone) {
                None => {
                    debug!("OrderedSet {}: new slot {}", self.desired.set_name, ordinal);
                    self.replicas
                        .insert(ordinal, Replica::new(&self.desired.set_name, ordinal, now));
                    self.removed.remove(&ordinal);
                    self.dirty.insert(ordinal);
                }
                Some(true) => {
                    self.apply_transition(ordinal, ReplicaPhase::Pending, now, actions);
                }
                Some(false) => {}
            }
        }

        let pending: Vec<u32> = self
            .replicas
            .range(n..)
            .filter(|(_, r)| r.phase == ReplicaPhase::Pending)
            .map(|(o, _)| *o)
            .collect();
        for ordinal in pending {
            self.apply_transition(ordinal, ReplicaPhase::Gone, now, actions);
        }

        let gone: Vec<u32> = self
            .replicas
            .range(n..)
            .filter(|(_, r)| r.phase == ReplicaPhase::Gone)
            .map(|(o, _)| *o)
            .collect();
        for ordinal in gone {
            self.replicas.remove(&ordinal);
            self.dirty.remove(&ordinal);
            self.removed.insert(ordinal);
            debug!("OrderedSet {}: removed slot {}", self.desired.set_name, ordinal);
        }
    }

    fn retry_deletes(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        for replica in self.replicas.values_mut() {
            if !replica.phase.is_terminating() || replica.retry_at.is_none_or(|t| t > now) {
                continue;
            }
            let Some(uid) = replica.pod_ref.clone() else {
                continue;
            };
            replica.retry_at = None;
            self.dirty.insert(replica.ordinal);
            info!("Replica {}: retrying delete", replica.name);
            actions.push(Action::DeleteInstance {
                ordinal: replica.ordinal,
                name: replica.name.clone(),
                uid,
            });
        }
    }

    /// Delete instances above the desired range. Returns whether any
    /// replica above the range is still on its way out.
    fn scale_down(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) -> bool {
        let n = self.desired.replicas;
        let candidates: Vec<u32> = self
            .replicas
            .range(n..)
            .filter(|(_, r)| {
                matches!(
                    r.phase,
                    ReplicaPhase::Creating | ReplicaPhase::Ready | ReplicaPhase::Failed(_)
                )
            })
            .map(|(o, _)| *o)
            .collect();

        match self.desired.policy {
            ManagementPolicy::Ordered => {
                let terminating = self
                    .replicas
                    .range(n..)
                    .any(|(_, r)| r.phase.is_terminating());
                let updating = self
                    .replicas
                    .values()
                    .any(|r| r.phase == ReplicaPhase::Terminating(TerminationCause::Update));
                if !terminating && !updating {
                    if let Some(&highest) = candidates.last() {
                        self.begin_termination(highest, TerminationCause::ScaleDown, now, actions);
                    }
                }
            }
            ManagementPolicy::Parallel => {
                for ordinal in candidates {
                    self.begin_termination(ordinal, TerminationCause::ScaleDown, now, actions);
                }
            }
        }

        self.replicas
            .range(n..)
            .any(|(_, r)| r.phase != ReplicaPhase::Gone)
    }

    /// Replace the highest outdated replica in `[partition, N)`, one at a
    /// time, once every replica in range is ready.
    fn roll_update(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let n = self.desired.replicas;
        let partition = self.desired.partition;
        if partition >= n || self.replicas.values().any(|r| r.phase.is_terminating()) {
            return;
        }
        let all_ready = (0..n).all(|o| self.replicas.get(&o).is_some_and(|r| r.is_ready()));
        if !all_ready {
            return;
        }
        let outdated = self
            .replicas
            .range(partition..n)
            .rev()
            .find(|(_, r)| r.revision.as_deref() != Some(self.desired.revision.as_str()))
            .map(|(o, _)| *o);
        if let Some(ordinal) = outdated {
            info!(
                "OrderedSet {}: updating ordinal {} to revision {}",
                self.desired.set_name, ordinal, self.desired.revision
            );
            self.begin_termination(ordinal, TerminationCause::Update, now, actions);
        }
    }

    fn scale_up(&mut self, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let n = self.desired.replicas;
        match self.desired.policy {
            ManagementPolicy::Ordered => {
                if self
                    .replicas
                    .range(..n)
                    .any(|(_, r)| r.phase == ReplicaPhase::Creating)
                {
                    return;
                }
                let blocking = (0..n).find(|o| !self.replicas.get(o).is_some_and(|r| r.is_ready()));
                if let Some(ordinal) = blocking {
                    if self
                        .replicas
                        .get(&ordinal)
                        .is_some_and(|r| r.phase == ReplicaPhase::Pending)
                    {
                        self.try_start(ordinal, now, actions);
                    }
                }
            }
            ManagementPolicy::Parallel => {
                let pending: Vec<u32> = self
                    .replicas
                    .range(..n)
                    .filter(|(_, r)| r.phase == ReplicaPhase::Pending)
                    .map(|(o, _)| *o)
                    .collect();
                for ordinal in pending {
                    self.try_start(ordinal, now, actions);
                }
            }
        }
    }

    /// Create the instance of a Pending replica once its claim is bound.
    fn try_start(&mut self, ordinal: u32, now: DateTime<Utc>, actions: &mut Vec<Action>) {
        let uid = Uuid::new_v4().to_string();
        let binding = match &self.desired.volume_template {
            Some(template) => {
                let ensured = self.binder.ensure(ordinal, template, now);
                if let Some(request) = ensured.request {
                    actions.push(Action::CreateClaim(request));
                }
                if !ensured.binding.is_bound() {
                    debug!(
                        "OrderedSet {}: ordinal {} waiting for claim {}",
                        self.desired.set_name, ordinal, ensured.binding.claim_name
                    );
                    return;
                }
                // Pending means no instance exists; any holder is a leftover.
                if let Some(holder) = &ensured.binding.attached_to {
                    debug!(
                        "Claim {}: dropping stale attachment to {}",
                        ensured.binding.claim_name, holder
                    );
                    self.binder.release(ordinal);
                }
                match self.binder.attach(ordinal, &uid) {
                    Ok(binding) => Some(binding),
                    Err(e) => {
                        warn!("OrderedSet {}: {}", self.desired.set_name, e);
                        return;
                    }
                }
            }
            None => None,
        };

        let Some(replica) = self.replicas.get_mut(&ordinal) else {
            return;
        };
        replica.pod_ref = Some(uid.clone());
        replica.address = None;
        replica.revision = Some(self.desired.revision.clone());
        if let Some(b) = &binding {
            replica.volume_claim_ref = Some(b.claim_name.clone());
        }
        let name = replica.name.clone();
        if !self.apply_transition(ordinal, ReplicaPhase::Creating, now, actions) {
            return;
        }
        info!(
            "OrderedSet {}: creating replica {} ({})",
            self.desired.set_name,
            name,
            self.desired.template.primary_image()
        );
        actions.push(Action::CreateInstance {
            ordinal,
            name,
            uid,
            template: self.desired.template.clone(),
            binding,
        });
    }

    /// Move a replica to Terminating and ask for its instance to be deleted.
    /// A replica with no instance goes straight to Gone.
    fn begin_termination(
        &mut self,
        ordinal: u32,
        cause: TerminationCause,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) {
        let Some((name, uid)) = self
            .replicas
            .get(&ordinal)
            .map(|r| (r.name.clone(), r.pod_ref.clone()))
        else {
            return;
        };
        if !self.apply_transition(ordinal, ReplicaPhase::Terminating(cause), now, actions) {
            return;
        }
        match uid {
            Some(uid) => {
                info!(
                    "OrderedSet {}: deleting replica {} ({})",
                    self.desired.set_name, name, cause
                );
                actions.push(Action::DeleteInstance { ordinal, name, uid });
            }
            None => {
                self.apply_transition(ordinal, ReplicaPhase::Gone, now, actions);
            }
        }
    }

    /// Apply a phase change and its side effects on DNS and storage.
    /// Returns false, after logging, when the state machine refuses it.
    fn apply_transition(
        &mut self,
        ordinal: u32,
        to: ReplicaPhase,
        now: DateTime<Utc>,
        actions: &mut Vec<Action>,
    ) -> bool {
        let Some(replica) = self.replicas.get_mut(&ordinal) else {
            return false;
        };
        let transition = match replica.transition(to, now) {
            Ok(t) => t,
            Err(e) => {
                warn!("OrderedSet {}: {}", self.desired.set_name, e);
                return false;
            }
        };
        debug!(
            "Replica {}: {} -> {}",
            replica.name, transition.from, transition.to
        );
        if transition.from == ReplicaPhase::Ready {
            actions.extend(self.dns.retract(ordinal).into_iter().map(Action::Dns));
        }
        if transition.to == ReplicaPhase::Gone {
            self.binder.release(ordinal);
        }
        if self.journal.len() >= TRANSITION_JOURNAL_CAPACITY {
            self.journal.pop_front();
        }
        self.journal.push_back(transition);
        self.dirty.insert(ordinal);
        true
    }

    // --- Conditions and status ---

    fn refresh_conditions(&mut self, now: DateTime<Utc>) {
        let n = self.desired.replicas;
        let mut conditions: Vec<SetCondition> = self.rejected.iter().cloned().collect();

        for replica in self.replicas.range(..n).map(|(_, r)| r) {
            if replica.phase != ReplicaPhase::Pending {
                continue;
            }
            let Some(binding) = self.binder.lookup(replica.ordinal) else {
                continue;
            };
            if let Some(failure) = binding.failure.as_ref().filter(|_| !binding.is_bound()) {
                conditions.push(SetCondition {
                    kind: ConditionKind::ProvisioningFailed,
                    ordinal: Some(replica.ordinal),
                    message: format!("claim {}: {}", binding.claim_name, failure.reason),
                    since: now,
                });
            }
        }

        for replica in self.replicas.values() {
            if let Some(reason) = replica.last_failure.as_ref().filter(|_| !replica.is_ready()) {
                conditions.push(SetCondition {
                    kind: ConditionKind::StartupFailed,
                    ordinal: Some(replica.ordinal),
                    message: format!(
                        "replica {}: {} (restarts={})",
                        replica.name, reason, replica.restart_count
                    ),
                    since: now,
                });
            }
        }

        if self.desired.policy == ManagementPolicy::Ordered {
            let blocking = (0..n)
                .filter_map(|o| self.replicas.get(&o))
                .find(|r| !r.is_ready());
            if let Some(replica) = blocking {
                let stalled_for = (now - replica.last_transition).to_std().unwrap_or_default();
                if stalled_for > self.config.stall_threshold {
                    conditions.push(SetCondition {
                        kind: ConditionKind::StalledOrdering,
                        ordinal: Some(replica.ordinal),
                        message: format!(
                            "replica {} has been {} for {}s",
                            replica.name,
                            replica.phase,
                            stalled_for.as_secs()
                        ),
                        since: now,
                    });
                }
            }
        }

        for condition in conditions.iter_mut() {
            let previous = self
                .status
                .conditions
                .iter()
                .find(|c| c.kind == condition.kind && c.ordinal == condition.ordinal);
            match previous {
                Some(prev) => condition.since = prev.since,
                None if condition.kind != ConditionKind::InvalidSpec => {
                    warn!(
                        "OrderedSet {}: {}: {}",
                        self.desired.set_name, condition.kind, condition.message
                    );
                }
                None => {}
            }
        }
        self.status.conditions = conditions;
    }

    fn refresh_status(&mut self) {
        let n = self.desired.replicas;
        let revision = self.desired.revision.as_str();
        self.status.observed_generation = self.desired.generation;
        self.status.current_revision = self.desired.revision.clone();
        self.status.replicas = self.replicas.values().filter(|r| r.has_instance()).count() as u32;
        self.status.ready_replicas = self.replicas.values().filter(|r| r.is_ready()).count() as u32;
        self.status.updated_replicas = self
            .replicas
            .range(..n)
            .filter(|(_, r)| r.is_ready() && r.revision.as_deref() == Some(revision))
            .count() as u32;
    }
}

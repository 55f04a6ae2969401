use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::future::ready;
use futures_util::stream::{self, BoxStream};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::controller::{Backends, ControllerOptions, SetController, SetHandle};
use crate::interfaces::SpecSource;
use pkg_constants::state::ORDERED_SET_PREFIX;
use pkg_state::client::StateStore;
use pkg_state::watch::EventType;
use pkg_types::orderedset::{OrderedSet, OrderedSetStatus};

fn set_key(namespace: &str, name: &str) -> String {
    format!("{}{}/{}", ORDERED_SET_PREFIX, namespace, name)
}

/// Write a set into the store, bumping its generation.
pub async fn apply_set(store: &StateStore, mut set: OrderedSet) -> anyhow::Result<OrderedSet> {
    let key = set_key(&set.namespace, &set.name);
    let previous: Option<OrderedSet> = store.get_json(&key).await?;
    set.generation = previous.map_or(1, |p| p.generation + 1);
    store.put_json(&key, &set).await?;
    info!(
        "OrderedSet {}/{} applied (generation={}, replicas={})",
        set.namespace, set.name, set.generation, set.spec.replicas
    );
    Ok(set)
}

/// Remove a set from the store. Its controller scales it to zero; claims
/// and bindings are kept.
pub async fn delete_set(store: &StateStore, namespace: &str, name: &str) -> anyhow::Result<()> {
    store.delete(&set_key(namespace, name)).await?;
    info!("OrderedSet {}/{} deleted", namespace, name);
    Ok(())
}

// --- Spec source ---

/// Desired states read from `/registry/orderedsets/<ns>/<name>`.
#[derive(Clone)]
pub struct StoreSpecSource {
    store: StateStore,
}

impl StoreSpecSource {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SpecSource for StoreSpecSource {
    async fn watch_spec(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<BoxStream<'static, OrderedSet>> {
        let key = set_key(namespace, name);
        // Subscribe before reading so no update falls in between
        let events = self.store.events().watch_prefix(&key);
        let current: Option<OrderedSet> = self.store.get_json(&key).await?;

        let updates = events
            .filter(move |e| ready(e.key == key))
            .take_while(|e| ready(e.event_type == EventType::Put))
            .filter_map(|e| {
                let set = e.value.as_deref().and_then(|v| {
                    serde_json::from_slice::<OrderedSet>(v)
                        .map_err(|err| warn!("Unreadable OrderedSet at {}: {}", e.key, err))
                        .ok()
                });
                ready(set)
            });
        Ok(stream::iter(current).chain(updates).boxed())
    }
}

// --- Manager ---

/// Running set controllers, keyed by `<ns>/<name>`.
#[derive(Clone, Default)]
pub struct SetRegistry {
    inner: Arc<RwLock<BTreeMap<String, SetHandle>>>,
}

impl SetRegistry {
    pub async fn status(&self, namespace: &str, name: &str) -> Option<OrderedSetStatus> {
        let sets = self.inner.read().await;
        let handle = sets.get(&format!("{}/{}", namespace, name))?;
        let status = handle.status().borrow().clone();
        Some(status)
    }

    pub async fn statuses(&self) -> Vec<(String, OrderedSetStatus)> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, h)| (k.clone(), h.status().borrow().clone()))
            .collect()
    }

    /// Delete the instance of one ordinal of a running set.
    pub async fn delete_replica(
        &self,
        namespace: &str,
        name: &str,
        ordinal: u32,
    ) -> anyhow::Result<()> {
        let sets = self.inner.read().await;
        let handle = sets
            .get(&format!("{}/{}", namespace, name))
            .ok_or_else(|| anyhow::anyhow!("OrderedSet {}/{} is not running", namespace, name))?;
        handle.delete_replica(ordinal).await
    }

    pub async fn abort_all(&self) {
        for (_, handle) in std::mem::take(&mut *self.inner.write().await) {
            handle.abort();
        }
    }
}

/// Starts one [`SetController`] per set found in the store.
pub struct OrderedSetManager {
    store: StateStore,
    backends: Backends,
    options: ControllerOptions,
    registry: SetRegistry,
}

impl OrderedSetManager {
    pub fn new(store: StateStore, backends: Backends, options: ControllerOptions) -> Self {
        Self {
            store,
            backends,
            options,
            registry: SetRegistry::default(),
        }
    }

    pub fn registry(&self) -> SetRegistry {
        self.registry.clone()
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "OrderedSetManager started (interval={}s)",
                self.options.resync_interval.as_secs()
            );
            let mut events = Box::pin(self.store.events().watch_prefix(ORDERED_SET_PREFIX));
            let mut interval = tokio::time::interval(self.options.resync_interval);
            loop {
                if let Err(e) = self.reconcile().await {
                    warn!("OrderedSetManager reconcile error: {}", e);
                }
                tokio::select! {
                    Some(_) = events.next() => {}
                    _ = interval.tick() => {}
                }
            }
        })
    }

    /// Start controllers for sets that have none. A set whose controller
    /// is still draining after a delete gets a new one once it exits.
    async fn reconcile(&self) -> anyhow::Result<()> {
        let entries = self.store.list_prefix(ORDERED_SET_PREFIX).await?;
        let mut sets = self.registry.inner.write().await;
        sets.retain(|key, handle| {
            let finished = handle.is_finished();
            if finished {
                info!("OrderedSetManager: controller for {} exited", key);
            }
            !finished
        });

        for (key, _) in entries {
            let Some((namespace, name)) = key
                .strip_prefix(ORDERED_SET_PREFIX)
                .and_then(|rest| rest.split_once('/'))
            else {
                continue;
            };
            let id = format!("{}/{}", namespace, name);
            if sets.contains_key(&id) {
                continue;
            }
            let controller = SetController::new(
                namespace,
                name,
                self.backends.clone(),
                Arc::new(StoreSpecSource::new(self.store.clone())),
                Some(self.store.clone()),
                self.options,
            );
            sets.insert(id, controller.start());
        }
        Ok(())
    }
}

use pkg_constants::state::{REPLICA_PREFIX, VOLUME_BINDING_PREFIX};
use pkg_state::client::StateStore;
use pkg_types::volume::VolumeBinding;
use tracing::{debug, warn};

use crate::reconciler::Changes;
use crate::replica::Replica;

/// Persists the replica arena and the volume bindings of one set.
///
/// Keys:
///   /registry/replicas/<ns>/<set>/<ordinal>
///   /registry/volumebindings/<ns>/<set>/<ordinal>
///
/// Binding records are never deleted here, so a set recreated under the
/// same name picks its claims up again.
#[derive(Clone)]
pub struct Checkpoint {
    store: StateStore,
    namespace: String,
    set_name: String,
}

impl Checkpoint {
    pub fn new(store: StateStore, namespace: &str, set_name: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            set_name: set_name.to_string(),
        }
    }

    fn replica_prefix(&self) -> String {
        format!("{}{}/{}/", REPLICA_PREFIX, self.namespace, self.set_name)
    }

    fn binding_prefix(&self) -> String {
        format!(
            "{}{}/{}/",
            VOLUME_BINDING_PREFIX, self.namespace, self.set_name
        )
    }

    pub async fn load(&self) -> anyhow::Result<(Vec<Replica>, Vec<VolumeBinding>)> {
        let replicas = self
            .store
            .list_prefix(&self.replica_prefix())
            .await?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_slice(&value) {
                Ok(replica) => Some(replica),
                Err(e) => {
                    warn!("Checkpoint: skipping unreadable record {}: {}", key, e);
                    None
                }
            })
            .collect();
        let bindings = self
            .store
            .list_prefix(&self.binding_prefix())
            .await?
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_slice(&value) {
                Ok(binding) => Some(binding),
                Err(e) => {
                    warn!("Checkpoint: skipping unreadable record {}: {}", key, e);
                    None
                }
            })
            .collect();
        Ok((replicas, bindings))
    }

    pub async fn save(&self, changes: &Changes) -> anyhow::Result<()> {
        for ordinal in &changes.removed {
            self.store
                .delete(&format!("{}{}", self.replica_prefix(), ordinal))
                .await?;
        }
        for replica in &changes.replicas {
            self.store
                .put_json(
                    &format!("{}{}", self.replica_prefix(), replica.ordinal),
                    replica,
                )
                .await?;
        }
        for binding in &changes.bindings {
            self.store
                .put_json(
                    &format!("{}{}", self.binding_prefix(), binding.ordinal),
                    binding,
                )
                .await?;
        }
        debug!(
            "Checkpoint {}/{}: {} replicas, {} removed, {} bindings",
            self.namespace,
            self.set_name,
            changes.replicas.len(),
            changes.removed.len(),
            changes.bindings.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pkg_types::volume::BindingStatus;

    fn binding(ordinal: u32) -> VolumeBinding {
        VolumeBinding {
            ordinal,
            claim_name: format!("data-web-{}", ordinal),
            status: BindingStatus::Bound,
            attached_to: None,
            attempts: 1,
            failure: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = StateStore::in_memory();
        let checkpoint = Checkpoint::new(store.clone(), "default", "web");
        let now = Utc::now();

        checkpoint
            .save(&Changes {
                replicas: vec![Replica::new("web", 0, now), Replica::new("web", 1, now)],
                removed: vec![],
                bindings: vec![binding(0), binding(1)],
            })
            .await
            .unwrap();

        // Another set sharing the name prefix is not picked up
        Checkpoint::new(store.clone(), "default", "web-1")
            .save(&Changes {
                replicas: vec![Replica::new("web-1", 0, now)],
                removed: vec![],
                bindings: vec![],
            })
            .await
            .unwrap();

        let (replicas, bindings) = checkpoint.load().await.unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[1].name, "web-1");
        assert_eq!(bindings.len(), 2);
    }

    #[tokio::test]
    async fn test_removed_slot_keeps_binding() {
        let store = StateStore::in_memory();
        let checkpoint = Checkpoint::new(store.clone(), "default", "web");
        checkpoint
            .save(&Changes {
                replicas: vec![Replica::new("web", 0, Utc::now())],
                removed: vec![],
                bindings: vec![binding(0)],
            })
            .await
            .unwrap();
        checkpoint
            .save(&Changes {
                replicas: vec![],
                removed: vec![0],
                bindings: vec![],
            })
            .await
            .unwrap();

        let (replicas, bindings) = checkpoint.load().await.unwrap();
        assert!(replicas.is_empty());
        assert_eq!(bindings[0].claim_name, "data-web-0");
        assert!(
            store
                .get("/registry/volumebindings/default/web/0")
                .await
                .unwrap()
                .is_some()
        );
    }
}

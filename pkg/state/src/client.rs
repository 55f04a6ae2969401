use serde::Serialize;
use serde::de::DeserializeOwned;
use slatedb::Db;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::info;

use crate::watch::{EventLog, EventType};
use pkg_constants::state::EVENT_LOG_CAPACITY;

#[derive(Clone)]
enum Backend {
    Slate(Db),
    Memory(Arc<RwLock<BTreeMap<String, Vec<u8>>>>),
}

/// Persistent state store backed by SlateDB on a local filesystem, or by an
/// in-memory map for tests and throwaway runs.
///
/// Every put/delete is recorded in the store's [`EventLog`] so controllers
/// can watch key prefixes.
#[derive(Clone)]
pub struct StateStore {
    backend: Backend,
    events: EventLog,
    read_only: Arc<AtomicBool>,
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;

        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            backend: Backend::Slate(db),
            events: EventLog::new(EVENT_LOG_CAPACITY),
            read_only: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create an empty store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(BTreeMap::new()))),
            events: EventLog::new(EVENT_LOG_CAPACITY),
            read_only: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Event log fed by every mutation of this store.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Refuse every put and delete until switched back. Shared by all
    /// clones of this store.
    pub fn set_read_only(&self, read_only: bool) {
        if self.read_only.swap(read_only, Ordering::SeqCst) != read_only {
            info!("State store is now {}", if read_only { "read-only" } else { "writable" });
        }
    }

    fn check_writable(&self, key: &str) -> anyhow::Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            anyhow::bail!("state store is read-only, refusing write to {}", key);
        }
        Ok(())
    }

    /// Store a value under the given key.
    pub async fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.check_writable(key)?;
        match &self.backend {
            Backend::Slate(db) => {
                db.put(key.as_bytes(), value)
                    .await
                    .map_err(|e| anyhow::anyhow!("SlateDB put failed: {}", e))?;
            }
            Backend::Memory(map) => {
                map.write().await.insert(key.to_string(), value.to_vec());
            }
        }
        self.events
            .emit(EventType::Put, key.to_string(), Some(value.to_vec()))
            .await;
        Ok(())
    }

    /// Retrieve the value for a key, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Slate(db) => match db.get(key.as_bytes()).await {
                Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
                Ok(None) => Ok(None),
                Err(e) => Err(anyhow::anyhow!("SlateDB get failed: {}", e)),
            },
            Backend::Memory(map) => Ok(map.read().await.get(key).cloned()),
        }
    }

    /// Delete a key from the store.
    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.check_writable(key)?;
        match &self.backend {
            Backend::Slate(db) => {
                db.delete(key.as_bytes())
                    .await
                    .map_err(|e| anyhow::anyhow!("SlateDB delete failed: {}", e))?;
            }
            Backend::Memory(map) => {
                map.write().await.remove(key);
            }
        }
        self.events
            .emit(EventType::Delete, key.to_string(), None)
            .await;
        Ok(())
    }

    /// List all key-value pairs whose keys start with `prefix`.
    /// Returns them as `(key_string, raw_bytes)`.
    pub async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
        match &self.backend {
            Backend::Slate(db) => {
                let mut results = Vec::new();
                let mut iter = db
                    .scan_prefix(prefix.as_bytes())
                    .await
                    .map_err(|e| anyhow::anyhow!("SlateDB scan_prefix failed: {}", e))?;

                while let Ok(Some(kv)) = iter.next().await {
                    let key = String::from_utf8_lossy(&kv.key).to_string();
                    results.push((key, kv.value.to_vec()));
                }
                Ok(results)
            }
            Backend::Memory(map) => Ok(map
                .read()
                .await
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
        }
    }

    /// Serialize `value` as JSON and store it under `key`.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let data = serde_json::to_vec(value)?;
        self.put(key, &data).await
    }

    /// Fetch and deserialize a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing state store");
        match self.backend {
            Backend::Slate(db) => db
                .close()
                .await
                .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e)),
            Backend::Memory(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        ordinal: u32,
        claim: String,
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = StateStore::in_memory();
        store.put("/registry/a", b"one").await.unwrap();
        assert_eq!(store.get("/registry/a").await.unwrap(), Some(b"one".to_vec()));

        store.delete("/registry/a").await.unwrap();
        assert!(store.get("/registry/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_is_bounded() {
        let store = StateStore::in_memory();
        store.put("/registry/replicas/default/web/0", b"0").await.unwrap();
        store.put("/registry/replicas/default/web/1", b"1").await.unwrap();
        store.put("/registry/replicas/default/webx/0", b"x").await.unwrap();
        store.put("/registry/volumebindings/default/web/0", b"v").await.unwrap();

        let entries = store
            .list_prefix("/registry/replicas/default/web/")
            .await
            .unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "/registry/replicas/default/web/0",
                "/registry/replicas/default/web/1"
            ]
        );
    }

    #[tokio::test]
    async fn test_json_roundtrip_and_events() {
        let store = StateStore::in_memory();
        let record = Record {
            ordinal: 2,
            claim: "data-web-2".to_string(),
        };
        store.put_json("/k", &record).await.unwrap();
        let back: Option<Record> = store.get_json("/k").await.unwrap();
        assert_eq!(back, Some(record));

        store.delete("/k").await.unwrap();
        let events = store.events().events_since(0).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Put);
        assert_eq!(events[1].event_type, EventType::Delete);
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let store = StateStore::in_memory();
        store.put("/registry/a", b"one").await.unwrap();

        let clone = store.clone();
        clone.set_read_only(true);
        assert!(store.put("/registry/b", b"two").await.is_err());
        assert!(store.delete("/registry/a").await.is_err());
        assert_eq!(store.get("/registry/a").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.events().current_seq().await, 1);

        clone.set_read_only(false);
        store.put("/registry/b", b"two").await.unwrap();
        assert_eq!(store.get("/registry/b").await.unwrap(), Some(b"two".to_vec()));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

/// In-memory event log that tracks all state mutations with monotonic sequence numbers.
/// Clients can subscribe to receive events filtered by key prefix.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<RwLock<EventLogInner>>,
    sender: broadcast::Sender<WatchEvent>,
}

struct EventLogInner {
    seq: u64,
    /// Ring buffer of recent events (capped)
    events: VecDeque<WatchEvent>,
    max_events: usize,
}

impl EventLog {
    /// Create a new event log with the given capacity for recent events.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(EventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events,
            })),
            sender,
        }
    }

    /// Record a new event. Called internally by StateStore on put/delete.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) {
        let mut inner = self.inner.write().await;
        inner.seq += 1;
        let event = WatchEvent {
            seq: inner.seq,
            event_type,
            key,
            value,
        };
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Get the current sequence number.
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    /// Get all retained events since the given sequence number.
    pub async fn events_since(&self, from_seq: u64) -> Vec<WatchEvent> {
        let inner = self.inner.read().await;
        inner
            .events
            .iter()
            .filter(|e| e.seq > from_seq)
            .cloned()
            .collect()
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Stream of new events whose key starts with `prefix`.
    /// Events dropped because the subscriber lagged are skipped.
    pub fn watch_prefix(&self, prefix: &str) -> impl Stream<Item = WatchEvent> + Send + 'static {
        let prefix = prefix.to_string();
        BroadcastStream::new(self.sender.subscribe()).filter_map(move |res| match res {
            Ok(event) if event.key.starts_with(&prefix) => Some(event),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_and_ring_buffer() {
        let log = EventLog::new(2);
        log.emit(EventType::Put, "/a".to_string(), Some(b"1".to_vec()))
            .await;
        log.emit(EventType::Put, "/b".to_string(), None).await;
        log.emit(EventType::Delete, "/a".to_string(), None).await;

        assert_eq!(log.current_seq().await, 3);
        let retained = log.events_since(0).await;
        assert_eq!(retained.len(), 2);
        assert_eq!(retained[0].seq, 2);
        assert_eq!(retained[1].event_type, EventType::Delete);

        let newer = log.events_since(2).await;
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].key, "/a");
    }

    #[tokio::test]
    async fn test_watch_prefix_filters_keys() {
        let log = EventLog::new(16);
        let mut stream = Box::pin(log.watch_prefix("/registry/orderedsets/"));

        log.emit(EventType::Put, "/registry/replicas/x".to_string(), None)
            .await;
        log.emit(
            EventType::Put,
            "/registry/orderedsets/default/web".to_string(),
            None,
        )
        .await;

        let event = stream.next().await.unwrap();
        assert_eq!(event.key, "/registry/orderedsets/default/web");
        assert_eq!(event.seq, 2);
    }
}

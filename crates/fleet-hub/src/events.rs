use chrono::Utc;
use fleet_core::event::{Event, EventKind, EventRecord, EventStats, EventStore, NewEvent};
use fleet_core::protocol::{AgentEvent, HUB_SENDER_ID};
use fleet_core::store::{EventSink, StoreError};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::folder_stats::FolderStatsCache;

/// Ingestion pipeline for agent events: typed decode, ring buffer, durable
/// sink, folder-stats cache.
#[derive(Clone)]
pub struct EventProcessor {
    store: Arc<RwLock<EventStore>>,
    sink: Option<Arc<dyn EventSink>>,
    folder_stats: FolderStatsCache,
}

impl EventProcessor {
    pub fn new(
        capacity: usize,
        sink: Option<Arc<dyn EventSink>>,
        folder_stats: FolderStatsCache,
    ) -> Self {
        Self {
            store: Arc::new(RwLock::new(EventStore::new(capacity))),
            sink,
            folder_stats,
        }
    }

    pub async fn ingest(&self, agent_id: &str, event: AgentEvent) -> Event {
        let kind = EventKind::decode(&event.event_type, &event.data);
        let new_event = NewEvent {
            agent_id: agent_id.to_string(),
            event_type: event.event_type,
            category: kind.category(),
            timestamp: Utc::now(),
            data: event.data,
        };
        let id = self.store.write().await.store(new_event.clone());
        let stored = Event {
            id,
            agent_id: new_event.agent_id,
            event_type: new_event.event_type,
            category: new_event.category,
            timestamp: new_event.timestamp,
            data: new_event.data,
            processed: false,
        };
        debug!(
            event = "agent_event_stored",
            agent_id = %agent_id,
            event_id = stored.id,
            kind = %stored.event_type,
            category = stored.category.as_str()
        );

        if let Some(sink) = self.sink.clone() {
            let record = EventRecord::from_event(&stored, &kind);
            tokio::task::spawn_blocking(move || {
                if let Err(err) = sink.record_event(&record) {
                    warn!(
                        event = "event_sink_error",
                        event_id = record.event_id,
                        agent_id = %record.agent_id,
                        error = %err
                    );
                }
            });
        }

        self.folder_stats.observe_event(agent_id, &kind);
        stored
    }

    pub async fn query(&self, agent_filter: Option<&str>, since_id: u64, limit: usize) -> Vec<Event> {
        self.store.read().await.query(agent_filter, since_id, limit)
    }

    pub async fn stats(&self, agent_filter: Option<&str>) -> EventStats {
        self.store.read().await.stats(agent_filter)
    }

    pub async fn get(&self, id: u64) -> Option<Event> {
        self.store.read().await.get(id).cloned()
    }

    pub async fn mark_processed(&self, id: u64) -> bool {
        self.store.write().await.mark_processed(id)
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn capacity(&self) -> usize {
        self.store.read().await.capacity()
    }

    /// Durable history of one agent. Empty when no sink is configured.
    pub async fn history(&self, agent_id: &str, limit: usize) -> Result<Vec<EventRecord>, StoreError> {
        let Some(sink) = self.sink.clone() else {
            return Ok(Vec::new());
        };
        let agent_id = agent_id.to_string();
        tokio::task::spawn_blocking(move || sink.event_history(&agent_id, limit))
            .await
            .map_err(|err| StoreError::Backend(format!("history task failed: {err}")))?
    }
}

/// Console broadcast for a stored event.
pub fn agent_event_frame(event: &Event, session: bool) -> String {
    json!({
        "type": "agent_event",
        "agent_id": event.agent_id,
        "session": session,
        "sender_id": HUB_SENDER_ID,
        "event": event,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::event::EventCategory;
    use fleet_storage::FleetStore;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn agent_event(event_type: &str, data: Value) -> AgentEvent {
        AgentEvent {
            event_type: event_type.to_string(),
            data,
        }
    }

    #[tokio::test]
    async fn ingest_classifies_and_feeds_cache() {
        let cache = FolderStatsCache::new();
        let processor = EventProcessor::new(16, None, cache.clone());

        let state = processor
            .ingest(
                "nas",
                agent_event(
                    "StateChanged",
                    json!({"folder": "job-1", "from": "idle", "to": "syncing"}),
                ),
            )
            .await;
        assert_eq!(state.id, 1);
        assert_eq!(state.category, EventCategory::StateChange);
        assert!(cache.is_syncing("nas", "job-1"));

        let progress = processor
            .ingest(
                "nas",
                agent_event(
                    "DownloadProgress",
                    json!({"folder": "job-1", "file": "a.jpg", "bytes_done": 5, "bytes_total": 10}),
                ),
            )
            .await;
        assert_eq!(progress.category, EventCategory::TransferProgress);
        let cached = cache.cached("nas", "job-1").expect("progress cached");
        assert_eq!(cached.stats["download_progress"]["bytes_done"], 5);

        let generic = processor
            .ingest("nas", agent_event("DeviceConnected", json!({"id": "DEV"})))
            .await;
        assert_eq!(generic.category, EventCategory::Generic);

        assert!(processor.mark_processed(progress.id).await);
        assert!(processor.get(progress.id).await.expect("event").processed);
        let recent = processor.query(Some("nas"), 1, 10).await;
        let ids = recent.iter().map(|event| event.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(processor.stats(None).await.total, 3);
    }

    #[tokio::test]
    async fn ingest_writes_records_to_the_durable_sink() {
        let store = Arc::new(FleetStore::open_in_memory().expect("open db"));
        let sink: Arc<dyn EventSink> = store.clone();
        let processor = EventProcessor::new(4, Some(sink), FolderStatsCache::new());
        processor
            .ingest(
                "laptop",
                agent_event(
                    "FolderCompletion",
                    json!({"folder": "job-5", "completion": 100.0}),
                ),
            )
            .await;

        let mut history = Vec::new();
        for _ in 0..50 {
            history = store.event_history("laptop", 10).expect("history");
            if !history.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].folder_id.as_deref(), Some("job-5"));
        assert_eq!(history[0].category, EventCategory::TransferProgress);
    }

    #[test]
    fn event_frame_carries_agent_and_payload() {
        let event = Event {
            id: 9,
            agent_id: "nas".to_string(),
            event_type: "StateChanged".to_string(),
            category: EventCategory::StateChange,
            timestamp: Utc::now(),
            data: json!({"folder": "job-1"}),
            processed: false,
        };
        let frame: Value = serde_json::from_str(&agent_event_frame(&event, false)).expect("json");
        assert_eq!(frame["type"], "agent_event");
        assert_eq!(frame["event"]["id"], 9);
        assert_eq!(frame["event"]["type"], "StateChanged");
    }
}

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;
pub const HOURS_PER_DAY: usize = 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    StateChange,
    TransferProgress,
    Generic,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::StateChange => "state_change",
            EventCategory::TransferProgress => "transfer_progress",
            EventCategory::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChanged {
    pub folder: String,
    #[serde(default)]
    pub from: String,
    pub to: String,
}

impl StateChanged {
    /// Folder states in which the engine is moving or hashing data.
    pub fn is_active(&self) -> bool {
        matches!(
            self.to.as_str(),
            "syncing" | "scanning" | "sync-preparing" | "sync-waiting" | "scan-waiting"
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderScanProgress {
    pub folder: String,
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub folder: String,
    #[serde(default)]
    pub file: Option<String>,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FolderCompletion {
    pub folder: String,
    #[serde(default)]
    pub device: Option<String>,
    pub completion: f64,
    #[serde(default)]
    pub need_bytes: u64,
    #[serde(default)]
    pub global_bytes: u64,
}

/// Typed view of an agent event payload. Shapes that do not match their
/// declared type fall back to `Generic` instead of being guessed field by field.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    StateChanged(StateChanged),
    FolderScanProgress(FolderScanProgress),
    DownloadProgress(DownloadProgress),
    FolderCompletion(FolderCompletion),
    Generic(Value),
}

impl EventKind {
    pub fn decode(event_type: &str, data: &Value) -> Self {
        fn typed<T: serde::de::DeserializeOwned>(data: &Value) -> Option<T> {
            serde_json::from_value(data.clone()).ok()
        }

        let decoded = match event_type {
            "StateChanged" => typed(data).map(EventKind::StateChanged),
            "FolderScanProgress" => typed(data).map(EventKind::FolderScanProgress),
            "DownloadProgress" => typed(data).map(EventKind::DownloadProgress),
            "FolderCompletion" => typed(data).map(EventKind::FolderCompletion),
            _ => None,
        };
        decoded.unwrap_or_else(|| EventKind::Generic(data.clone()))
    }

    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::StateChanged(_) => EventCategory::StateChange,
            EventKind::FolderScanProgress(_)
            | EventKind::DownloadProgress(_)
            | EventKind::FolderCompletion(_) => EventCategory::TransferProgress,
            EventKind::Generic(_) => EventCategory::Generic,
        }
    }

    pub fn folder(&self) -> Option<&str> {
        match self {
            EventKind::StateChanged(value) => Some(&value.folder),
            EventKind::FolderScanProgress(value) => Some(&value.folder),
            EventKind::DownloadProgress(value) => Some(&value.folder),
            EventKind::FolderCompletion(value) => Some(&value.folder),
            EventKind::Generic(data) => data.get("folder").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: u64,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub processed: bool,
}

/// An event waiting for its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub agent_id: String,
    pub event_type: String,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Structured record handed to the durable sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: u64,
    pub agent_id: String,
    pub event_type: String,
    pub category: EventCategory,
    pub folder_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl EventRecord {
    pub fn from_event(event: &Event, kind: &EventKind) -> Self {
        Self {
            event_id: event.id,
            agent_id: event.agent_id.clone(),
            event_type: event.event_type.clone(),
            category: event.category,
            folder_id: kind.folder().map(str::to_string),
            timestamp: event.timestamp,
            data: event.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EventStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub hourly: Vec<usize>,
}

/// Fixed-capacity ring of events. Ids are strictly increasing in insertion
/// order; the id index only ever points at live slots.
#[derive(Debug)]
pub struct EventStore {
    slots: Vec<Option<Event>>,
    head: usize,
    len: usize,
    next_id: u64,
    index: HashMap<u64, usize>,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
            next_id: 1,
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn store(&mut self, event: NewEvent) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let slot = self.head;
        if let Some(evicted) = self.slots[slot].take() {
            self.index.remove(&evicted.id);
        } else {
            self.len += 1;
        }
        self.slots[slot] = Some(Event {
            id,
            agent_id: event.agent_id,
            event_type: event.event_type,
            category: event.category,
            timestamp: event.timestamp,
            data: event.data,
            processed: false,
        });
        self.index.insert(id, slot);
        self.head = (self.head + 1) % self.slots.len();
        id
    }

    pub fn get(&self, id: u64) -> Option<&Event> {
        self.index
            .get(&id)
            .and_then(|slot| self.slots[*slot].as_ref())
    }

    pub fn mark_processed(&mut self, id: u64) -> bool {
        let Some(slot) = self.index.get(&id).copied() else {
            return false;
        };
        match self.slots[slot].as_mut() {
            Some(event) => {
                event.processed = true;
                true
            }
            None => false,
        }
    }

    fn newest_first(&self) -> impl Iterator<Item = &Event> {
        let capacity = self.slots.len();
        (1..=self.len).filter_map(move |offset| {
            let slot = (self.head + capacity - offset) % capacity;
            self.slots[slot].as_ref()
        })
    }

    /// Newest matches with `id > since_id`, at most `limit`, returned oldest first.
    pub fn query(&self, agent_filter: Option<&str>, since_id: u64, limit: usize) -> Vec<Event> {
        let mut matches = Vec::new();
        if limit == 0 || self.is_empty() {
            return matches;
        }
        for event in self.newest_first() {
            if event.id <= since_id {
                break;
            }
            if agent_filter.is_some_and(|agent| agent != event.agent_id) {
                continue;
            }
            matches.push(event.clone());
            if matches.len() >= limit {
                break;
            }
        }
        matches.reverse();
        matches
    }

    pub fn stats(&self, agent_filter: Option<&str>) -> EventStats {
        let mut stats = EventStats {
            hourly: vec![0; HOURS_PER_DAY],
            ..EventStats::default()
        };
        for event in self.newest_first() {
            if agent_filter.is_some_and(|agent| agent != event.agent_id) {
                continue;
            }
            stats.total += 1;
            *stats.by_type.entry(event.event_type.clone()).or_default() += 1;
            stats.hourly[event.timestamp.hour() as usize] += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, hour, 15, 0)
            .single()
            .expect("valid timestamp")
    }

    fn new_event(agent: &str, event_type: &str, hour: u32) -> NewEvent {
        NewEvent {
            agent_id: agent.to_string(),
            event_type: event_type.to_string(),
            category: EventCategory::Generic,
            timestamp: at_hour(hour),
            data: json!({"folder": "job-1"}),
        }
    }

    #[test]
    fn overflow_evicts_oldest_and_keeps_ascending_order() {
        let capacity = 4;
        let mut store = EventStore::new(capacity);
        let ids = (0..=capacity)
            .map(|_| store.store(new_event("a", "StateChanged", 1)))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.len(), capacity);
        assert!(store.get(1).is_none());

        let events = store.query(None, 0, capacity);
        let got = events.iter().map(|event| event.id).collect::<Vec<_>>();
        assert_eq!(got, vec![2, 3, 4, 5]);
    }

    #[test]
    fn query_filters_by_agent_and_since_id_with_limit() {
        let mut store = EventStore::new(16);
        for index in 0..10 {
            let agent = if index % 2 == 0 { "a" } else { "b" };
            store.store(new_event(agent, "DownloadProgress", 3));
        }

        let events = store.query(Some("a"), 0, 3);
        let got = events.iter().map(|event| event.id).collect::<Vec<_>>();
        assert_eq!(got, vec![5, 7, 9]);

        let events = store.query(None, 8, 10);
        let got = events.iter().map(|event| event.id).collect::<Vec<_>>();
        assert_eq!(got, vec![9, 10]);

        assert!(store.query(None, 0, 0).is_empty());
    }

    #[test]
    fn stats_count_types_and_hours_in_one_pass() {
        let mut store = EventStore::new(8);
        store.store(new_event("a", "StateChanged", 0));
        store.store(new_event("a", "StateChanged", 23));
        store.store(new_event("a", "FolderScanProgress", 23));
        store.store(new_event("b", "StateChanged", 5));

        let all = store.stats(None);
        assert_eq!(all.total, 4);
        assert_eq!(all.by_type.get("StateChanged"), Some(&3));
        assert_eq!(all.hourly.len(), HOURS_PER_DAY);
        assert_eq!(all.hourly[23], 2);
        assert_eq!(all.hourly[0], 1);

        let only_b = store.stats(Some("b"));
        assert_eq!(only_b.total, 1);
        assert_eq!(only_b.hourly[5], 1);
    }

    #[test]
    fn processed_flag_is_the_only_mutation() {
        let mut store = EventStore::new(2);
        let id = store.store(new_event("a", "StateChanged", 1));
        assert!(store.mark_processed(id));
        assert!(store.get(id).expect("stored").processed);
        store.store(new_event("a", "StateChanged", 1));
        store.store(new_event("a", "StateChanged", 1));
        assert!(!store.mark_processed(id));
    }

    #[test]
    fn decode_picks_typed_variant_or_generic() {
        let state = EventKind::decode(
            "StateChanged",
            &json!({"folder": "job-9", "from": "idle", "to": "syncing"}),
        );
        assert_eq!(state.category(), EventCategory::StateChange);
        assert_eq!(state.folder(), Some("job-9"));
        let EventKind::StateChanged(change) = &state else {
            panic!("expected state change")
        };
        assert!(change.is_active());

        let progress = EventKind::decode(
            "DownloadProgress",
            &json!({"folder": "job-9", "bytes_done": 10, "bytes_total": 40}),
        );
        assert_eq!(progress.category(), EventCategory::TransferProgress);

        let malformed = EventKind::decode("FolderScanProgress", &json!({"folder": "job-9"}));
        assert!(matches!(malformed, EventKind::Generic(_)));
        assert_eq!(malformed.folder(), Some("job-9"));

        let unknown = EventKind::decode("DeviceConnected", &json!({"id": "DEV"}));
        assert_eq!(unknown.category(), EventCategory::Generic);
        assert_eq!(unknown.folder(), None);
    }
}

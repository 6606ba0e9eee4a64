use chrono::{DateTime, Utc};
use fleet_core::event::EventKind;
use fleet_core::protocol::AgentCommand;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::{correlation_key, CommandDispatcher, DispatchError};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatsOrigin {
    Periodic,
    Response,
    ProgressEvent,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CachedStats {
    pub stats: Value,
    pub updated_at: DateTime<Utc>,
    pub origin: StatsOrigin,
}

/// Where a served value came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatsSource {
    Live,
    Cached,
    Fallback,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FolderStatsView {
    pub agent_id: String,
    pub folder_id: String,
    pub syncing: bool,
    pub source: StatsSource,
    #[serde(flatten)]
    pub entry: CachedStats,
}

#[derive(Debug, Error)]
pub enum FolderStatsError {
    #[error("no folder stats for {agent_id}/{folder_id}: {source}")]
    Unavailable {
        agent_id: String,
        folder_id: String,
        #[source]
        source: DispatchError,
    },
}

pub fn stats_request_key(agent_id: &str, folder_id: &str) -> String {
    correlation_key(agent_id, &format!("folder_stats:{folder_id}"))
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(String, String), CachedStats>,
    syncing: HashMap<String, HashSet<String>>,
    /// Folders of deleted jobs. Late pushes for them are dropped.
    retired: HashSet<String>,
}

impl CacheState {
    fn accepts(&self, agent_id: &str, folder_id: &str) -> bool {
        if self.retired.contains(folder_id) {
            debug!(
                event = "folder_stats_retired",
                agent_id = %agent_id,
                folder_id = %folder_id
            );
            return false;
        }
        true
    }
}

/// Last known statistics per (agent, folder). Entries survive idle and pause
/// and are dropped only when the job or the destination goes away.
#[derive(Clone, Default)]
pub struct FolderStatsCache {
    inner: Arc<Mutex<CacheState>>,
}

impl FolderStatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, agent_id: &str, folder_id: &str, stats: Value, origin: StatsOrigin) {
        debug!(
            event = "folder_stats_recorded",
            agent_id = %agent_id,
            folder_id = %folder_id,
            origin = ?origin
        );
        let mut state = self.state();
        if !state.accepts(agent_id, folder_id) {
            return;
        }
        state.entries.insert(
            (agent_id.to_string(), folder_id.to_string()),
            CachedStats {
                stats,
                updated_at: Utc::now(),
                origin,
            },
        );
    }

    /// Folds progress fields into the cached snapshot, creating one if needed.
    pub fn merge_progress(&self, agent_id: &str, folder_id: &str, patch: Map<String, Value>) {
        let mut state = self.state();
        if !state.accepts(agent_id, folder_id) {
            return;
        }
        let entry = state
            .entries
            .entry((agent_id.to_string(), folder_id.to_string()))
            .or_insert_with(|| CachedStats {
                stats: Value::Object(Map::new()),
                updated_at: Utc::now(),
                origin: StatsOrigin::ProgressEvent,
            });
        if !entry.stats.is_object() {
            entry.stats = Value::Object(Map::new());
        }
        if let Some(object) = entry.stats.as_object_mut() {
            object.extend(patch);
        }
        entry.updated_at = Utc::now();
        entry.origin = StatsOrigin::ProgressEvent;
    }

    pub fn set_syncing(&self, agent_id: &str, folder_id: &str, syncing: bool) {
        let mut state = self.state();
        if syncing {
            if !state.accepts(agent_id, folder_id) {
                return;
            }
            state
                .syncing
                .entry(agent_id.to_string())
                .or_default()
                .insert(folder_id.to_string());
            return;
        }
        if let Some(folders) = state.syncing.get_mut(agent_id) {
            folders.remove(folder_id);
            if folders.is_empty() {
                state.syncing.remove(agent_id);
            }
        }
    }

    /// Drops every syncing flag of an agent that went offline.
    pub fn clear_syncing(&self, agent_id: &str) {
        if let Some(folders) = self.state().syncing.remove(agent_id) {
            debug!(
                event = "folder_stats_syncing_cleared",
                agent_id = %agent_id,
                folders = folders.len()
            );
        }
    }

    pub fn is_syncing(&self, agent_id: &str, folder_id: &str) -> bool {
        self.state()
            .syncing
            .get(agent_id)
            .is_some_and(|folders| folders.contains(folder_id))
    }

    pub fn cached(&self, agent_id: &str, folder_id: &str) -> Option<CachedStats> {
        self.state()
            .entries
            .get(&(agent_id.to_string(), folder_id.to_string()))
            .cloned()
    }

    pub fn observe_event(&self, agent_id: &str, kind: &EventKind) {
        match kind {
            EventKind::StateChanged(change) => {
                self.set_syncing(agent_id, &change.folder, change.is_active());
                if self.cached(agent_id, &change.folder).is_some() {
                    let mut patch = Map::new();
                    patch.insert("state".to_string(), json!(change.to));
                    self.merge_progress(agent_id, &change.folder, patch);
                }
            }
            EventKind::FolderScanProgress(progress) => {
                let mut patch = Map::new();
                patch.insert(
                    "scan_progress".to_string(),
                    json!({
                        "current": progress.current,
                        "total": progress.total,
                        "rate": progress.rate,
                    }),
                );
                self.merge_progress(agent_id, &progress.folder, patch);
            }
            EventKind::DownloadProgress(progress) => {
                let mut patch = Map::new();
                patch.insert(
                    "download_progress".to_string(),
                    json!({
                        "file": progress.file,
                        "bytes_done": progress.bytes_done,
                        "bytes_total": progress.bytes_total,
                    }),
                );
                self.merge_progress(agent_id, &progress.folder, patch);
            }
            EventKind::FolderCompletion(completion) => {
                let mut patch = Map::new();
                patch.insert("completion".to_string(), json!(completion.completion));
                patch.insert("need_bytes".to_string(), json!(completion.need_bytes));
                patch.insert("global_bytes".to_string(), json!(completion.global_bytes));
                self.merge_progress(agent_id, &completion.folder, patch);
            }
            EventKind::Generic(_) => {}
        }
    }

    pub fn clear(&self, agent_id: &str, folder_id: &str) {
        let mut state = self.state();
        state
            .entries
            .remove(&(agent_id.to_string(), folder_id.to_string()));
        if let Some(folders) = state.syncing.get_mut(agent_id) {
            folders.remove(folder_id);
        }
    }

    /// Forgets a deleted job's folder for every agent and retires its id.
    pub fn clear_folder(&self, folder_id: &str) {
        let mut state = self.state();
        state.retired.insert(folder_id.to_string());
        state.entries.retain(|(_, folder), _| folder != folder_id);
        for folders in state.syncing.values_mut() {
            folders.remove(folder_id);
        }
        state.syncing.retain(|_, folders| !folders.is_empty());
    }

    fn view(
        &self,
        agent_id: &str,
        folder_id: &str,
        entry: CachedStats,
        source: StatsSource,
    ) -> FolderStatsView {
        FolderStatsView {
            agent_id: agent_id.to_string(),
            folder_id: folder_id.to_string(),
            syncing: self.is_syncing(agent_id, folder_id),
            source,
            entry,
        }
    }

    /// While the agent is syncing the folder the cached value is authoritative.
    /// Otherwise the agent is asked; on failure the last known value is served
    /// as a fallback.
    pub async fn fetch(
        &self,
        dispatcher: &CommandDispatcher,
        agent_id: &str,
        folder_id: &str,
        timeout: Duration,
    ) -> Result<FolderStatsView, FolderStatsError> {
        if self.is_syncing(agent_id, folder_id) {
            if let Some(entry) = self.cached(agent_id, folder_id) {
                debug!(event = "folder_stats_cached", agent_id = %agent_id, folder_id = %folder_id);
                return Ok(self.view(agent_id, folder_id, entry, StatsSource::Cached));
            }
        }

        let command = AgentCommand::GetFolderStats {
            folder_id: folder_id.to_string(),
        };
        let key = stats_request_key(agent_id, folder_id);
        match dispatcher
            .dispatch_and_await(agent_id, &command, &key, timeout)
            .await
        {
            Ok(stats) => {
                let entry = CachedStats {
                    stats,
                    updated_at: Utc::now(),
                    origin: StatsOrigin::Response,
                };
                let mut state = self.state();
                if state.accepts(agent_id, folder_id) {
                    state.entries.insert(
                        (agent_id.to_string(), folder_id.to_string()),
                        entry.clone(),
                    );
                }
                drop(state);
                Ok(self.view(agent_id, folder_id, entry, StatsSource::Live))
            }
            Err(err) => match self.cached(agent_id, folder_id) {
                Some(entry) => {
                    warn!(
                        event = "folder_stats_fallback",
                        agent_id = %agent_id,
                        folder_id = %folder_id,
                        error = %err
                    );
                    Ok(self.view(agent_id, folder_id, entry, StatsSource::Fallback))
                }
                None => Err(FolderStatsError::Unavailable {
                    agent_id: agent_id.to_string(),
                    folder_id: folder_id.to_string(),
                    source: err,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Hub;
    use fleet_core::event::StateChanged;
    use tokio::sync::mpsc;

    async fn setup() -> (FolderStatsCache, CommandDispatcher, mpsc::Receiver<String>) {
        let hub = Hub::spawn();
        let (tx, rx) = mpsc::channel(8);
        hub.register_agent("nas", "agent-1", None, tx)
            .await
            .expect("register");
        (FolderStatsCache::new(), CommandDispatcher::new(hub, 64 * 1024), rx)
    }

    fn syncing(folder: &str) -> EventKind {
        EventKind::StateChanged(StateChanged {
            folder: folder.to_string(),
            from: "idle".to_string(),
            to: "syncing".to_string(),
        })
    }

    #[tokio::test]
    async fn syncing_folder_is_served_from_cache_without_dispatch() {
        let (cache, dispatcher, mut rx) = setup().await;
        cache.record("nas", "job-1", json!({"files": 10}), StatsOrigin::Periodic);
        cache.observe_event("nas", &syncing("job-1"));

        let view = cache
            .fetch(&dispatcher, "nas", "job-1", Duration::from_millis(50))
            .await
            .expect("cached stats");
        assert_eq!(view.source, StatsSource::Cached);
        assert!(view.syncing);
        assert_eq!(view.entry.stats["files"], 10);
        assert_eq!(view.entry.stats["state"], "syncing");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_without_entry_is_an_error_and_with_entry_is_fallback() {
        let (cache, dispatcher, mut rx) = setup().await;
        let missing = cache
            .fetch(&dispatcher, "nas", "job-2", Duration::from_millis(50))
            .await;
        assert!(matches!(
            missing,
            Err(FolderStatsError::Unavailable {
                source: DispatchError::Timeout { .. },
                ..
            })
        ));
        let frame = rx.recv().await.expect("stats request sent");
        assert!(frame.contains("get_folder_stats"));

        cache.record("nas", "job-2", json!({"files": 4}), StatsOrigin::Periodic);
        let fallback = cache
            .fetch(&dispatcher, "nas", "job-2", Duration::from_millis(50))
            .await
            .expect("fallback");
        assert_eq!(fallback.source, StatsSource::Fallback);
        assert_eq!(fallback.entry.origin, StatsOrigin::Periodic);
    }

    #[tokio::test]
    async fn live_reply_refreshes_entry() {
        let (cache, dispatcher, mut rx) = setup().await;
        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                rx.recv().await.expect("frame");
                dispatcher.resolve(
                    "nas",
                    &stats_request_key("nas", "job-3"),
                    Ok(json!({"files": 8, "bytes": 2048})),
                );
            })
        };
        let view = cache
            .fetch(&dispatcher, "nas", "job-3", Duration::from_secs(2))
            .await
            .expect("live stats");
        responder.await.expect("responder");
        assert_eq!(view.source, StatsSource::Live);
        assert_eq!(
            cache.cached("nas", "job-3").expect("cached").origin,
            StatsOrigin::Response
        );
    }

    #[test]
    fn entries_survive_idle_and_clear_only_on_delete() {
        let cache = FolderStatsCache::new();
        cache.record("nas", "job-1", json!({"files": 1}), StatsOrigin::Response);
        cache.record("laptop", "job-1", json!({"files": 1}), StatsOrigin::Response);
        cache.record("laptop", "job-9", json!({"files": 1}), StatsOrigin::Response);
        cache.observe_event("nas", &syncing("job-1"));
        cache.observe_event(
            "nas",
            &EventKind::StateChanged(StateChanged {
                folder: "job-1".to_string(),
                from: "syncing".to_string(),
                to: "idle".to_string(),
            }),
        );
        assert!(!cache.is_syncing("nas", "job-1"));
        assert!(cache.cached("nas", "job-1").is_some());

        cache.clear("laptop", "job-9");
        assert!(cache.cached("laptop", "job-9").is_none());
        assert!(cache.cached("laptop", "job-1").is_some());

        cache.clear_folder("job-1");
        assert!(cache.cached("nas", "job-1").is_none());
        assert!(cache.cached("laptop", "job-1").is_none());
    }

    #[tokio::test]
    async fn offline_agent_is_asked_live_instead_of_served_from_cache() {
        let (cache, dispatcher, mut rx) = setup().await;
        cache.record("nas", "job-4", json!({"files": 2}), StatsOrigin::Periodic);
        cache.observe_event("nas", &syncing("job-4"));
        cache.clear_syncing("nas");
        assert!(!cache.is_syncing("nas", "job-4"));

        let view = cache
            .fetch(&dispatcher, "nas", "job-4", Duration::from_millis(50))
            .await
            .expect("fallback");
        assert_eq!(view.source, StatsSource::Fallback);
        assert!(!view.syncing);
        let frame = rx.recv().await.expect("stats request sent");
        assert!(frame.contains("get_folder_stats"));
    }

    #[test]
    fn late_updates_for_a_deleted_folder_are_dropped() {
        let cache = FolderStatsCache::new();
        cache.record("nas", "job-5", json!({"files": 1}), StatsOrigin::Periodic);
        cache.clear_folder("job-5");

        cache.record("nas", "job-5", json!({"files": 2}), StatsOrigin::Periodic);
        cache.observe_event("nas", &syncing("job-5"));
        cache.observe_event(
            "nas",
            &EventKind::FolderCompletion(fleet_core::event::FolderCompletion {
                folder: "job-5".to_string(),
                device: None,
                completion: 50.0,
                need_bytes: 10,
                global_bytes: 20,
            }),
        );
        assert!(cache.cached("nas", "job-5").is_none());
        assert!(!cache.is_syncing("nas", "job-5"));

        cache.record("nas", "job-6", json!({"files": 3}), StatsOrigin::Periodic);
        assert!(cache.cached("nas", "job-6").is_some());
    }
}

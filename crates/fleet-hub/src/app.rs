use axum::{routing::get, Router};
use fleet_core::store::{EventSink, JobRepository};
use std::sync::Arc;

use crate::api;
use crate::config::Config;
use crate::connection::{agent_ws_handler, console_ws_handler};
use crate::dispatch::CommandDispatcher;
use crate::events::EventProcessor;
use crate::folder_stats::FolderStatsCache;
use crate::jobs::JobService;
use crate::registry::Hub;
use crate::saga::JobSaga;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Hub,
    pub dispatcher: CommandDispatcher,
    pub events: EventProcessor,
    pub folder_stats: FolderStatsCache,
    pub jobs: JobService,
}

impl AppState {
    /// Starts the registry owner task; must run inside a Tokio runtime.
    pub fn new(
        config: Config,
        repo: Arc<dyn JobRepository>,
        sink: Option<Arc<dyn EventSink>>,
    ) -> Self {
        let hub = Hub::spawn();
        let dispatcher = CommandDispatcher::new(hub.clone(), config.max_frame_bytes);
        let folder_stats = FolderStatsCache::new();
        let events = EventProcessor::new(config.event_capacity, sink, folder_stats.clone());
        let saga = JobSaga::new(hub.clone(), dispatcher.clone(), config.confirmation);
        let jobs = JobService::new(repo, saga, folder_stats.clone());
        Self {
            config: Arc::new(config),
            hub,
            dispatcher,
            events,
            folder_stats,
            jobs,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/agent", get(agent_ws_handler))
        .route("/ws/cli", get(console_ws_handler))
        .merge(api::routes())
        .with_state(state)
}

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use fleet_core::event::{Event, EventRecord, EventStats};
use fleet_core::job::{Job, NewJob};
use fleet_core::store::StoreError;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use crate::app::AppState;
use crate::dispatch::DispatchError;
use crate::folder_stats::{FolderStatsError, FolderStatsView};
use crate::jobs::JobError;
use crate::registry::AgentView;
use crate::saga::SagaError;

const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(event = "api_error", status = status.as_u16(), error = %self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn from_dispatch(message: String, err: &DispatchError) -> ApiError {
    match err {
        DispatchError::Timeout { .. } => ApiError::Timeout(message),
        _ => ApiError::Upstream(message),
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let message = err.to_string();
        match err {
            JobError::Invalid(_) => ApiError::BadRequest(message),
            JobError::NotFound(_) | JobError::UnknownDestination { .. } => {
                ApiError::NotFound(message)
            }
            JobError::LastDestination(_) => ApiError::Conflict(message),
            JobError::Saga(SagaError::ParticipantNotReady { .. }) => ApiError::Conflict(message),
            JobError::Saga(SagaError::StepFailed { source, .. }) => from_dispatch(message, &source),
            JobError::Store(StoreError::JobNotFound(_)) => ApiError::NotFound(message),
            JobError::Store(StoreError::Backend(_)) => ApiError::Internal(message),
        }
    }
}

impl From<FolderStatsError> for ApiError {
    fn from(err: FolderStatsError) -> Self {
        let message = err.to_string();
        match &err {
            FolderStatsError::Unavailable { source, .. } => from_dispatch(message, source),
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:agent_id", delete(delete_agent))
        .route("/api/agents/:agent_id/history", get(agent_history))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/api/jobs/:job_id/pause", post(pause_job))
        .route("/api/jobs/:job_id/resume", post(resume_job))
        .route(
            "/api/jobs/:job_id/destinations/:agent_id",
            delete(remove_destination),
        )
        .route("/api/jobs/:job_id/stats/:agent_id", get(folder_stats))
        .route("/api/events", get(list_events))
        .route("/api/events/stats", get(event_stats))
        .route("/api/events/:event_id", get(get_event))
        .route("/api/events/:event_id/processed", post(mark_event_processed))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.hub.snapshot_agents().await;
    let online = agents.values().filter(|agent| agent.is_online).count();
    Json(json!({
        "status": "ok",
        "agents": agents.len(),
        "agents_online": online,
        "events": state.events.len().await,
        "event_capacity": state.events.capacity().await,
    }))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentView>> {
    let mut agents = state
        .hub
        .snapshot_agents()
        .await
        .into_values()
        .collect::<Vec<_>>();
    agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    Json(agents)
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .hub
        .remove_agent(&agent_id)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if !removed {
        return Err(ApiError::NotFound(format!("agent not found: {agent_id}")));
    }
    state.folder_stats.clear_syncing(&agent_id);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn agent_history(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<EventRecord>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(state.config.event_capacity);
    state
        .events
        .history(&agent_id, limit)
        .await
        .map(Json)
        .map_err(|err| ApiError::Internal(err.to_string()))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.jobs.list_jobs().await?))
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.jobs.create_job(request).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.get_job(&job_id).await?))
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.jobs.delete_job(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.pause_job(&job_id).await?))
}

async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.resume_job(&job_id).await?))
}

async fn remove_destination(
    State(state): State<AppState>,
    Path((job_id, agent_id)): Path<(String, String)>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.jobs.remove_destination(&job_id, &agent_id).await?))
}

async fn folder_stats(
    State(state): State<AppState>,
    Path((job_id, agent_id)): Path<(String, String)>,
) -> Result<Json<FolderStatsView>, ApiError> {
    let job = state.jobs.get_job(&job_id).await?;
    if !job.participant_ids().iter().any(|id| id == &agent_id) {
        return Err(ApiError::NotFound(format!(
            "agent {agent_id} does not take part in job {job_id}"
        )));
    }
    let view = state
        .folder_stats
        .fetch(
            &state.dispatcher,
            &agent_id,
            &job.folder_id(),
            state.config.stats_timeout,
        )
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct EventQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    since_id: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Json<Vec<Event>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(state.config.event_capacity);
    Json(
        state
            .events
            .query(query.agent_id.as_deref(), query.since_id.unwrap_or(0), limit)
            .await,
    )
}

async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<u64>,
) -> Result<Json<Event>, ApiError> {
    state
        .events
        .get(event_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("event not found: {event_id}")))
}

async fn mark_event_processed(
    State(state): State<AppState>,
    Path(event_id): Path<u64>,
) -> Result<Json<Event>, ApiError> {
    if !state.events.mark_processed(event_id).await {
        return Err(ApiError::NotFound(format!("event not found: {event_id}")));
    }
    get_event(State(state), Path(event_id)).await
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    agent_id: Option<String>,
}

async fn event_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Json<EventStats> {
    Json(state.events.stats(query.agent_id.as_deref()).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::router;
    use crate::config::Config;
    use crate::saga::tests::ready_agent;
    use crate::saga::Confirmation;
    use axum::body::Body;
    use axum::http::Request;
    use fleet_core::protocol::AgentEvent;
    use fleet_core::store::EventSink;
    use fleet_storage::FleetStore;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = Arc::new(FleetStore::open_in_memory().expect("open db"));
        let config = Config {
            confirmation: Confirmation::FireAndForget,
            stats_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let sink: Arc<dyn EventSink> = store.clone();
        AppState::new(config, store, Some(sink))
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .expect("request");
        let response = router(state.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    #[tokio::test]
    async fn job_lifecycle_over_http() {
        let state = test_state();
        let _src = ready_agent(&state.hub, "src", 16).await;
        let _dst = ready_agent(&state.hub, "dst", 16).await;

        let (status, job) = call(
            &state,
            "POST",
            "/api/jobs",
            Some(json!({
                "name": "photos",
                "source_agent": "src",
                "source_path": "/srv/photos",
                "destination_agent": "dst",
                "destination_path": "/backup/photos",
                "schedule_type": "hourly"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let job_id = job["id"].as_str().expect("job id").to_string();
        assert_eq!(job["destinations"][0]["agent_id"], "dst");

        let (status, paused) = call(&state, "POST", &format!("/api/jobs/{job_id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paused["status"], "paused");

        let (status, jobs) = call(&state, "GET", "/api/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs.as_array().map(Vec::len), Some(1));

        let (status, error) = call(
            &state,
            "DELETE",
            &format!("/api/jobs/{job_id}/destinations/dst"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(error["error"].is_string());

        let (status, _) = call(&state, "DELETE", &format!("/api/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, "GET", &format!("/api/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_and_unready_jobs_map_to_client_errors() {
        let state = test_state();
        let (status, _) = call(
            &state,
            "POST",
            "/api/jobs",
            Some(json!({"name": "x", "source_agent": "src", "source_path": "/srv"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            "POST",
            "/api/jobs",
            Some(json!({
                "name": "x",
                "source_agent": "src",
                "source_path": "/srv",
                "destinations": [{"agent_id": "dst", "path": "/b"}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn folder_stats_without_cache_times_out() {
        let state = test_state();
        let _src = ready_agent(&state.hub, "src", 16).await;
        let _dst = ready_agent(&state.hub, "dst", 16).await;
        let (_, job) = call(
            &state,
            "POST",
            "/api/jobs",
            Some(json!({
                "name": "docs",
                "source_agent": "src",
                "source_path": "/srv/docs",
                "destinations": [{"agent_id": "dst", "path": "/b/docs"}]
            })),
        )
        .await;
        let job_id = job["id"].as_str().expect("job id");

        let (status, _) = call(&state, "GET", &format!("/api/jobs/{job_id}/stats/dst"), None).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        let (status, _) = call(&state, "GET", &format!("/api/jobs/{job_id}/stats/other"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_and_agents_are_listed() {
        let state = test_state();
        let _src = ready_agent(&state.hub, "src", 16).await;
        for folder in ["job-1", "job-2", "job-3"] {
            state
                .events
                .ingest(
                    "src",
                    AgentEvent {
                        event_type: "StateChanged".to_string(),
                        data: json!({"folder": folder, "from": "idle", "to": "scanning"}),
                    },
                )
                .await;
        }

        let (status, events) = call(&state, "GET", "/api/events?agent_id=src&since_id=1&limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids = events
            .as_array()
            .expect("array")
            .iter()
            .map(|event| event["id"].as_u64().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 3]);

        let (_, stats) = call(&state, "GET", "/api/events/stats", None).await;
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["by_type"]["StateChanged"], 3);

        let (_, agents) = call(&state, "GET", "/api/agents", None).await;
        assert_eq!(agents[0]["agent_id"], "src");
        assert_eq!(agents[0]["is_online"], true);

        let (status, _) = call(&state, "DELETE", "/api/agents/src", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&state, "DELETE", "/api/agents/src", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, processed) = call(&state, "POST", "/api/events/2/processed", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(processed["processed"], true);
        let (_, event) = call(&state, "GET", "/api/events/1", None).await;
        assert_eq!(event["processed"], false);
        let (status, _) = call(&state, "GET", "/api/events/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, health) = call(&state, "GET", "/health", None).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["events"], 3);
    }

    #[tokio::test]
    async fn agent_history_comes_from_the_durable_store() {
        let state = test_state();
        for (index, to) in ["scanning", "syncing", "idle"].into_iter().enumerate() {
            state
                .events
                .ingest(
                    "nas",
                    AgentEvent {
                        event_type: "StateChanged".to_string(),
                        data: json!({"folder": "job-7", "from": "idle", "to": to}),
                    },
                )
                .await;
            for _ in 0..100 {
                if state.events.history("nas", 10).await.expect("history").len() > index {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let (status, history) = call(&state, "GET", "/api/agents/nas/history?limit=2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().map(Vec::len), Some(2));
        assert_eq!(history[0]["event_id"], 2);
        assert_eq!(history[1]["event_id"], 3);
        assert_eq!(history[1]["folder_id"], "job-7");

        let (_, other) = call(&state, "GET", "/api/agents/laptop/history", None).await;
        assert_eq!(other, json!([]));
    }
}

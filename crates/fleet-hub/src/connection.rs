use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use fleet_core::protocol::{
    console_error_frame, decode_text, parse_console_command, AgentMessage, AgentReply,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::events::agent_event_frame;
use crate::folder_stats::{stats_request_key, StatsOrigin};
use crate::registry::AgentUpdate;

#[derive(Debug, Deserialize)]
pub struct AgentParams {
    #[serde(default)]
    agent_id: Option<String>,
}

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<AgentParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(agent_id) = params
        .agent_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        warn!(event = "agent_id_missing", remote = %remote);
        return (StatusCode::BAD_REQUEST, "agent_id is required").into_response();
    };
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_agent_socket(state, socket, agent_id, remote))
        .into_response()
}

pub async fn console_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_console_socket(state, socket, remote))
}

/// Drains the outbound mailbox into the socket and keeps it alive with pings.
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
    write_timeout: Duration,
    conn_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = (!ping_interval.is_zero()).then(|| {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });
        loop {
            let message = tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => Message::Text(frame),
                    None => break,
                },
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => Message::Ping(Vec::new()),
            };
            match tokio::time::timeout(write_timeout, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = "write_error", conn_id = %conn_id, error = %err);
                    break;
                }
                Err(_) => {
                    warn!(event = "write_timeout", conn_id = %conn_id);
                    break;
                }
            }
        }
        let _ = sink.close().await;
    })
}

async fn handle_agent_socket(
    state: AppState,
    socket: WebSocket,
    agent_id: String,
    remote: SocketAddr,
) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(state.config.queue_capacity);
    let conn_id = state.hub.next_conn_id("agent");
    let writer = spawn_writer(
        sink,
        rx,
        state.config.ping_interval,
        state.config.write_timeout,
        conn_id.clone(),
    );

    if let Err(err) = state
        .hub
        .register_agent(&agent_id, &conn_id, Some(remote.ip().to_string()), tx)
        .await
    {
        warn!(event = "agent_register_failed", agent_id = %agent_id, error = %err);
        let _ = writer.await;
        return;
    }

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        match message {
            Message::Text(text) => handle_agent_frame(&state, &agent_id, &text).await,
            Message::Binary(_) => {
                warn!(event = "binary_frame_ignored", conn_id = %conn_id);
            }
            Message::Close(_) => {
                info!(event = "agent_close", conn_id = %conn_id, agent_id = %agent_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                let _ = state.hub.update_agent(&agent_id, AgentUpdate::Touch).await;
            }
        }
    }

    // Releasing the record drops the hub's sender, which ends the writer.
    // A stale socket leaves the flags of the live one alone.
    if let Ok(true) = state
        .hub
        .unregister_agent(&agent_id, &conn_id, "disconnect")
        .await
    {
        state.folder_stats.clear_syncing(&agent_id);
    }
    if tokio::time::timeout(state.config.write_timeout, writer).await.is_err() {
        debug!(event = "writer_detached", conn_id = %conn_id);
    }
}

pub async fn handle_agent_frame(state: &AppState, agent_id: &str, text: &str) {
    let message: AgentMessage = match decode_text(text, state.config.max_frame_bytes) {
        Ok(message) => message,
        Err(err) => {
            warn!(event = "agent_frame_invalid", agent_id = %agent_id, error = %err);
            return;
        }
    };
    if state.config.debug {
        debug!(event = "agent_frame", agent_id = %agent_id, kind = message.kind());
    }

    match message {
        AgentMessage::Register {
            device_id,
            data_dir,
        } => {
            let _ = state
                .hub
                .update_agent(
                    agent_id,
                    AgentUpdate::Identify {
                        device_id,
                        data_dir,
                    },
                )
                .await;
        }
        AgentMessage::Health {
            system_info,
            data_dir,
        } => {
            let _ = state
                .hub
                .update_agent(
                    agent_id,
                    AgentUpdate::Health {
                        system: system_info,
                        data_dir,
                    },
                )
                .await;
        }
        AgentMessage::Event { event } => {
            let stored = state.events.ingest(agent_id, event).await;
            let _ = state.hub.broadcast(agent_event_frame(&stored, false)).await;
        }
        AgentMessage::SessionEvent { event } => {
            let stored = state.events.ingest(agent_id, event).await;
            let _ = state.hub.broadcast(agent_event_frame(&stored, true)).await;
        }
        AgentMessage::Response(reply) => {
            route_reply(state, agent_id, "response", reply, false).await;
        }
        AgentMessage::BrowseResponse(reply) => {
            route_reply(state, agent_id, "browse_response", reply, false).await;
        }
        AgentMessage::Error(reply) => {
            route_reply(state, agent_id, "error", reply, true).await;
        }
        AgentMessage::BrowseError(reply) => {
            route_reply(state, agent_id, "browse_error", reply, true).await;
        }
        AgentMessage::FolderStatsResponse {
            folder_id,
            stats,
            cli_id,
            request_id,
        } => {
            state
                .folder_stats
                .record(agent_id, &folder_id, stats.clone(), StatsOrigin::Response);
            let key = request_id.unwrap_or_else(|| stats_request_key(agent_id, &folder_id));
            if state.dispatcher.resolve(agent_id, &key, Ok(stats.clone())) {
                return;
            }
            if let Some(cli_id) = cli_id {
                let frame = json!({
                    "type": "folder_stats_response",
                    "agent_id": agent_id,
                    "folder_id": folder_id,
                    "stats": stats,
                });
                let _ = state.hub.send_to_console(&cli_id, frame.to_string()).await;
            }
        }
        AgentMessage::FolderStatsPeriodic { folder_id, stats } => {
            state
                .folder_stats
                .record(agent_id, &folder_id, stats, StatsOrigin::Periodic);
        }
    }
}

/// A reply either completes a waiting request or goes back to the console
/// that asked for it.
async fn route_reply(state: &AppState, agent_id: &str, kind: &str, reply: AgentReply, failed: bool) {
    if let Some(request_id) = reply.request_id.as_deref() {
        let outcome = if failed {
            Err(reply.error_message())
        } else {
            Ok(reply.to_value())
        };
        if state.dispatcher.resolve(agent_id, request_id, outcome) {
            return;
        }
    }
    let Some(cli_id) = reply.cli_id.as_deref() else {
        debug!(event = "reply_unrouted", agent_id = %agent_id, kind = kind);
        return;
    };
    let mut body = reply.body.clone();
    body.insert("type".to_string(), Value::String(kind.to_string()));
    body.entry("agent_id".to_string())
        .or_insert_with(|| Value::String(agent_id.to_string()));
    let _ = state
        .hub
        .send_to_console(cli_id, Value::Object(body).to_string())
        .await;
}

async fn handle_console_socket(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(state.config.queue_capacity);
    let conn_id = state.hub.next_conn_id("cli");
    let writer = spawn_writer(
        sink,
        rx,
        state.config.ping_interval,
        state.config.write_timeout,
        conn_id.clone(),
    );
    if let Err(err) = state.hub.register_console(&conn_id, tx).await {
        warn!(event = "console_register_failed", conn_id = %conn_id, error = %err);
        let _ = writer.await;
        return;
    }
    debug!(event = "console_remote", conn_id = %conn_id, remote = %remote);

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        match message {
            Message::Text(text) => handle_console_frame(&state, &conn_id, &text).await,
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let _ = state.hub.unregister_console(&conn_id).await;
    if tokio::time::timeout(state.config.write_timeout, writer).await.is_err() {
        debug!(event = "writer_detached", conn_id = %conn_id);
    }
}

pub async fn handle_console_frame(state: &AppState, conn_id: &str, text: &str) {
    let command = match parse_console_command(text, state.config.max_frame_bytes) {
        Ok(command) => command,
        Err(err) => {
            warn!(event = "console_frame_invalid", conn_id = %conn_id, error = %err);
            let frame = console_error_frame(&err.to_string(), None);
            let _ = state.hub.send_to_console(conn_id, frame.to_string()).await;
            return;
        }
    };
    let agent_id = command.agent_id.clone();
    debug!(
        event = "console_command",
        conn_id = %conn_id,
        agent_id = %agent_id,
        command = %command.command_type
    );
    let frame = command.stamped_for_agent(conn_id).to_string();
    let _ = state.hub.route_command(conn_id, &agent_id, frame).await;
}

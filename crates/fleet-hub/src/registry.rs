use chrono::{DateTime, Utc};
use fleet_core::protocol::{console_error_frame, SystemInfo, HUB_SENDER_ID};
use serde::Serialize;
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

/// Outbound mailbox of one socket. The writer task drains it.
pub type Outbound = mpsc::Sender<String>;

const REQUEST_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("agent {0} is not registered")]
    UnknownAgent(String),
    #[error("agent {0} is offline")]
    Offline(String),
    #[error("outbound queue for agent {0} is full")]
    Saturated(String),
    #[error("hub is not running")]
    HubUnavailable,
}

#[derive(Debug, Clone)]
pub struct AgentConnection {
    pub agent_id: String,
    pub conn_id: Option<String>,
    pub sender: Option<Outbound>,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub device_id: Option<String>,
    pub data_dir: Option<String>,
    pub address: Option<String>,
    pub system: Option<SystemInfo>,
}

/// Copy of an agent record handed out to readers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentView {
    pub agent_id: String,
    pub is_online: bool,
    pub last_seen: DateTime<Utc>,
    pub device_id: Option<String>,
    pub data_dir: Option<String>,
    pub address: Option<String>,
    pub system: Option<SystemInfo>,
}

impl From<&AgentConnection> for AgentView {
    fn from(agent: &AgentConnection) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            is_online: agent.is_online,
            last_seen: agent.last_seen,
            device_id: agent.device_id.clone(),
            data_dir: agent.data_dir.clone(),
            address: agent.address.clone(),
            system: agent.system.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AgentUpdate {
    Identify {
        device_id: String,
        data_dir: Option<String>,
    },
    Health {
        system: Option<SystemInfo>,
        data_dir: Option<String>,
    },
    Touch,
}

enum HubRequest {
    RegisterAgent {
        agent_id: String,
        conn_id: String,
        address: Option<String>,
        sender: Outbound,
        reply: oneshot::Sender<()>,
    },
    UnregisterAgent {
        agent_id: String,
        conn_id: String,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    RegisterConsole {
        conn_id: String,
        sender: Outbound,
        reply: oneshot::Sender<()>,
    },
    UnregisterConsole {
        conn_id: String,
        reply: oneshot::Sender<()>,
    },
    UpdateAgent {
        agent_id: String,
        update: AgentUpdate,
        reply: oneshot::Sender<bool>,
    },
    RouteCommand {
        from_conn: String,
        agent_id: String,
        frame: String,
    },
    SendToConsole {
        conn_id: String,
        frame: String,
    },
    Deliver {
        agent_id: String,
        frame: String,
        reply: oneshot::Sender<Result<(), DeliveryError>>,
    },
    Broadcast {
        frame: String,
    },
    RemoveAgent {
        agent_id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the connection registry. Every mutation is a request processed in
/// order by a single owner task; snapshots read the shared map directly.
#[derive(Clone)]
pub struct Hub {
    requests: mpsc::Sender<HubRequest>,
    agents: Arc<RwLock<HashMap<String, AgentConnection>>>,
    conn_counter: Arc<AtomicU64>,
}

impl Hub {
    pub fn spawn() -> Self {
        let (requests, receiver) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let agents = Arc::new(RwLock::new(HashMap::new()));
        let owner = HubOwner {
            agents: agents.clone(),
            consoles: HashMap::new(),
        };
        tokio::spawn(owner.run(receiver));
        Self {
            requests,
            agents,
            conn_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn next_conn_id(&self, prefix: &str) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{id}")
    }

    async fn submit(&self, request: HubRequest) -> Result<(), DeliveryError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| DeliveryError::HubUnavailable)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubRequest,
    ) -> Result<T, DeliveryError> {
        let (reply, response) = oneshot::channel();
        self.submit(build(reply)).await?;
        response.await.map_err(|_| DeliveryError::HubUnavailable)
    }

    pub async fn register_agent(
        &self,
        agent_id: &str,
        conn_id: &str,
        address: Option<String>,
        sender: Outbound,
    ) -> Result<(), DeliveryError> {
        self.request(|reply| HubRequest::RegisterAgent {
            agent_id: agent_id.to_string(),
            conn_id: conn_id.to_string(),
            address,
            sender,
            reply,
        })
        .await
    }

    /// Returns false when `conn_id` no longer owns the agent record.
    pub async fn unregister_agent(
        &self,
        agent_id: &str,
        conn_id: &str,
        reason: &str,
    ) -> Result<bool, DeliveryError> {
        self.request(|reply| HubRequest::UnregisterAgent {
            agent_id: agent_id.to_string(),
            conn_id: conn_id.to_string(),
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    pub async fn register_console(
        &self,
        conn_id: &str,
        sender: Outbound,
    ) -> Result<(), DeliveryError> {
        self.request(|reply| HubRequest::RegisterConsole {
            conn_id: conn_id.to_string(),
            sender,
            reply,
        })
        .await
    }

    pub async fn unregister_console(&self, conn_id: &str) -> Result<(), DeliveryError> {
        self.request(|reply| HubRequest::UnregisterConsole {
            conn_id: conn_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn update_agent(
        &self,
        agent_id: &str,
        update: AgentUpdate,
    ) -> Result<bool, DeliveryError> {
        self.request(|reply| HubRequest::UpdateAgent {
            agent_id: agent_id.to_string(),
            update,
            reply,
        })
        .await
    }

    /// Forwards a console frame; failures come back to the console as an error frame.
    pub async fn route_command(
        &self,
        from_conn: &str,
        agent_id: &str,
        frame: String,
    ) -> Result<(), DeliveryError> {
        self.submit(HubRequest::RouteCommand {
            from_conn: from_conn.to_string(),
            agent_id: agent_id.to_string(),
            frame,
        })
        .await
    }

    pub async fn send_to_console(&self, conn_id: &str, frame: String) -> Result<(), DeliveryError> {
        self.submit(HubRequest::SendToConsole {
            conn_id: conn_id.to_string(),
            frame,
        })
        .await
    }

    pub async fn deliver(&self, agent_id: &str, frame: String) -> Result<(), DeliveryError> {
        self.request(|reply| HubRequest::Deliver {
            agent_id: agent_id.to_string(),
            frame,
            reply,
        })
        .await?
    }

    pub async fn broadcast(&self, frame: String) -> Result<(), DeliveryError> {
        self.submit(HubRequest::Broadcast { frame }).await
    }

    pub async fn remove_agent(&self, agent_id: &str) -> Result<bool, DeliveryError> {
        self.request(|reply| HubRequest::RemoveAgent {
            agent_id: agent_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn snapshot_agents(&self) -> HashMap<String, AgentView> {
        self.agents
            .read()
            .await
            .iter()
            .map(|(agent_id, agent)| (agent_id.clone(), AgentView::from(agent)))
            .collect()
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentView> {
        self.agents.read().await.get(agent_id).map(AgentView::from)
    }
}

pub fn agent_status_frame(agent_id: &str, status: &str, reason: Option<&str>) -> String {
    let mut frame = json!({
        "type": "agent_status",
        "agent_id": agent_id,
        "status": status,
        "sender_id": HUB_SENDER_ID,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let (Some(reason), Some(object)) = (reason, frame.as_object_mut()) {
        object.insert("reason".to_string(), json!(reason));
    }
    frame.to_string()
}

struct HubOwner {
    agents: Arc<RwLock<HashMap<String, AgentConnection>>>,
    consoles: HashMap<String, Outbound>,
}

impl HubOwner {
    async fn run(mut self, mut requests: mpsc::Receiver<HubRequest>) {
        while let Some(request) = requests.recv().await {
            self.handle(request).await;
        }
        debug!(event = "hub_owner_stopped");
    }

    async fn handle(&mut self, request: HubRequest) {
        match request {
            HubRequest::RegisterAgent {
                agent_id,
                conn_id,
                address,
                sender,
                reply,
            } => {
                self.register_agent(&agent_id, &conn_id, address, sender)
                    .await;
                let _ = reply.send(());
            }
            HubRequest::UnregisterAgent {
                agent_id,
                conn_id,
                reason,
                reply,
            } => {
                let released = self.unregister_agent(&agent_id, &conn_id, &reason).await;
                let _ = reply.send(released);
            }
            HubRequest::RegisterConsole {
                conn_id,
                sender,
                reply,
            } => {
                info!(event = "console_connected", conn_id = %conn_id);
                self.consoles.insert(conn_id, sender);
                let _ = reply.send(());
            }
            HubRequest::UnregisterConsole { conn_id, reply } => {
                if self.consoles.remove(&conn_id).is_some() {
                    info!(event = "console_disconnected", conn_id = %conn_id);
                }
                let _ = reply.send(());
            }
            HubRequest::UpdateAgent {
                agent_id,
                update,
                reply,
            } => {
                let updated = self.update_agent(&agent_id, update).await;
                let _ = reply.send(updated);
            }
            HubRequest::RouteCommand {
                from_conn,
                agent_id,
                frame,
            } => {
                if let Err(err) = self.deliver(&agent_id, frame).await {
                    warn!(
                        event = "route_miss",
                        conn_id = %from_conn,
                        agent_id = %agent_id,
                        error = %err
                    );
                    let error_frame = console_error_frame(&err.to_string(), Some(&agent_id));
                    self.send_to_console(&from_conn, error_frame.to_string());
                }
            }
            HubRequest::SendToConsole { conn_id, frame } => {
                self.send_to_console(&conn_id, frame);
            }
            HubRequest::Deliver {
                agent_id,
                frame,
                reply,
            } => {
                let result = self.deliver(&agent_id, frame).await;
                let _ = reply.send(result);
            }
            HubRequest::Broadcast { frame } => {
                self.broadcast(&frame);
            }
            HubRequest::RemoveAgent { agent_id, reply } => {
                let removed = self.agents.write().await.remove(&agent_id).is_some();
                if removed {
                    info!(event = "agent_removed", agent_id = %agent_id);
                    self.broadcast(&agent_status_frame(&agent_id, "removed", None));
                }
                let _ = reply.send(removed);
            }
        }
    }

    async fn register_agent(
        &mut self,
        agent_id: &str,
        conn_id: &str,
        address: Option<String>,
        sender: Outbound,
    ) {
        let now = Utc::now();
        let reconnect = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(agent_id) {
                Some(existing) => {
                    existing.conn_id = Some(conn_id.to_string());
                    existing.sender = Some(sender);
                    existing.is_online = true;
                    existing.last_seen = now;
                    if address.is_some() {
                        existing.address = address;
                    }
                    true
                }
                None => {
                    agents.insert(
                        agent_id.to_string(),
                        AgentConnection {
                            agent_id: agent_id.to_string(),
                            conn_id: Some(conn_id.to_string()),
                            sender: Some(sender),
                            is_online: true,
                            last_seen: now,
                            device_id: None,
                            data_dir: None,
                            address,
                            system: None,
                        },
                    );
                    false
                }
            }
        };
        info!(
            event = "agent_connected",
            agent_id = %agent_id,
            conn_id = %conn_id,
            reconnect
        );
        self.broadcast(&agent_status_frame(agent_id, "online", None));
    }

    async fn unregister_agent(&mut self, agent_id: &str, conn_id: &str, reason: &str) -> bool {
        let released = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(agent_id) {
                Some(agent) if agent.conn_id.as_deref() == Some(conn_id) => {
                    agent.conn_id = None;
                    agent.sender = None;
                    agent.is_online = false;
                    agent.last_seen = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if !released {
            debug!(
                event = "agent_unregister_stale",
                agent_id = %agent_id,
                conn_id = %conn_id
            );
            return false;
        }
        info!(
            event = "agent_disconnected",
            agent_id = %agent_id,
            conn_id = %conn_id,
            reason = reason
        );
        self.broadcast(&agent_status_frame(agent_id, "offline", Some(reason)));
        true
    }

    async fn update_agent(&mut self, agent_id: &str, update: AgentUpdate) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            debug!(event = "agent_update_miss", agent_id = %agent_id);
            return false;
        };
        agent.last_seen = Utc::now();
        match update {
            AgentUpdate::Identify {
                device_id,
                data_dir,
            } => {
                info!(
                    event = "agent_identified",
                    agent_id = %agent_id,
                    device_id = %device_id
                );
                agent.device_id = Some(device_id);
                if data_dir.is_some() {
                    agent.data_dir = data_dir;
                }
            }
            AgentUpdate::Health { system, data_dir } => {
                if system.is_some() {
                    agent.system = system;
                }
                if data_dir.is_some() {
                    agent.data_dir = data_dir;
                }
            }
            AgentUpdate::Touch => {}
        }
        true
    }

    async fn deliver(&self, agent_id: &str, frame: String) -> Result<(), DeliveryError> {
        let agents = self.agents.read().await;
        let Some(agent) = agents.get(agent_id) else {
            return Err(DeliveryError::UnknownAgent(agent_id.to_string()));
        };
        let Some(sender) = agent.sender.as_ref().filter(|_| agent.is_online) else {
            return Err(DeliveryError::Offline(agent_id.to_string()));
        };
        match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "agent_backpressure", agent_id = %agent_id);
                Err(DeliveryError::Saturated(agent_id.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(DeliveryError::Offline(agent_id.to_string()))
            }
        }
    }

    fn send_to_console(&mut self, conn_id: &str, frame: String) {
        let Some(sender) = self.consoles.get(conn_id) else {
            debug!(event = "console_gone", conn_id = %conn_id);
            return;
        };
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "console_backpressure", conn_id = %conn_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.consoles.remove(conn_id);
            }
        }
    }

    fn broadcast(&mut self, frame: &str) {
        let mut closed = Vec::new();
        for (conn_id, sender) in &self.consoles {
            match sender.try_send(frame.to_string()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "broadcast_dropped", conn_id = %conn_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(conn_id.clone());
                }
            }
        }
        for conn_id in closed {
            self.consoles.remove(&conn_id);
            debug!(event = "console_pruned", conn_id = %conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn mailbox(capacity: usize) -> (Outbound, mpsc::Receiver<String>) {
        mpsc::channel(capacity)
    }

    fn frame_type(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).expect("json frame");
        value["type"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn disconnect_keeps_record_and_reconnect_updates_in_place() {
        let hub = Hub::spawn();
        let (first_tx, _first_rx) = mailbox(8);
        hub.register_agent("nas", "agent-1", Some("10.0.0.5".to_string()), first_tx)
            .await
            .expect("register");
        hub.update_agent(
            "nas",
            AgentUpdate::Identify {
                device_id: "DEV-NAS".to_string(),
                data_dir: Some("/var/lib/sync".to_string()),
            },
        )
        .await
        .expect("identify");

        assert!(hub
            .unregister_agent("nas", "agent-1", "disconnect")
            .await
            .expect("unregister"));
        let offline = hub.agent("nas").await.expect("record retained");
        assert!(!offline.is_online);
        assert_eq!(offline.device_id.as_deref(), Some("DEV-NAS"));
        assert_eq!(
            hub.deliver("nas", "{}".to_string()).await,
            Err(DeliveryError::Offline("nas".to_string()))
        );

        let (second_tx, mut second_rx) = mailbox(8);
        hub.register_agent("nas", "agent-2", None, second_tx)
            .await
            .expect("reconnect");
        let agents = hub.snapshot_agents().await;
        assert_eq!(agents.len(), 1);
        let online = &agents["nas"];
        assert!(online.is_online);
        assert_eq!(online.device_id.as_deref(), Some("DEV-NAS"));
        assert_eq!(online.data_dir.as_deref(), Some("/var/lib/sync"));
        assert_eq!(online.address.as_deref(), Some("10.0.0.5"));

        hub.deliver("nas", "{\"type\":\"pause_job\"}".to_string())
            .await
            .expect("deliver after reconnect");
        assert_eq!(
            second_rx.recv().await.as_deref(),
            Some("{\"type\":\"pause_job\"}")
        );
    }

    #[tokio::test]
    async fn stale_unregister_does_not_mark_reconnected_agent_offline() {
        let hub = Hub::spawn();
        let (old_tx, _old_rx) = mailbox(8);
        let (new_tx, _new_rx) = mailbox(8);
        hub.register_agent("laptop", "agent-1", None, old_tx)
            .await
            .expect("register");
        hub.register_agent("laptop", "agent-2", None, new_tx)
            .await
            .expect("reconnect");

        let released = hub
            .unregister_agent("laptop", "agent-1", "disconnect")
            .await
            .expect("unregister");
        assert!(!released);
        assert!(hub.agent("laptop").await.expect("record").is_online);
    }

    #[tokio::test]
    async fn routing_to_unknown_agent_returns_error_frame_to_console() {
        let hub = Hub::spawn();
        let (console_tx, mut console_rx) = mailbox(8);
        hub.register_console("cli-1", console_tx)
            .await
            .expect("console");

        hub.route_command("cli-1", "ghost", "{}".to_string())
            .await
            .expect("route");
        let frame = console_rx.recv().await.expect("error frame");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "error");
        assert_eq!(value["agent_id"], "ghost");
        assert_eq!(value["sender_id"], HUB_SENDER_ID);
    }

    #[tokio::test]
    async fn saturated_mailbox_is_reported_without_blocking() {
        let hub = Hub::spawn();
        let (agent_tx, _agent_rx) = mailbox(1);
        hub.register_agent("slow", "agent-1", None, agent_tx)
            .await
            .expect("register");
        hub.deliver("slow", "one".to_string())
            .await
            .expect("first frame fits");
        assert_eq!(
            hub.deliver("slow", "two".to_string()).await,
            Err(DeliveryError::Saturated("slow".to_string()))
        );
        assert_eq!(
            hub.deliver("nobody", "x".to_string()).await,
            Err(DeliveryError::UnknownAgent("nobody".to_string()))
        );
    }

    #[tokio::test]
    async fn broadcast_skips_full_consoles_and_announces_status() {
        let hub = Hub::spawn();
        let (full_tx, _full_rx) = mailbox(1);
        let (open_tx, mut open_rx) = mailbox(8);
        hub.register_console("cli-full", full_tx)
            .await
            .expect("console");
        hub.register_console("cli-open", open_tx)
            .await
            .expect("console");

        let (agent_tx, _agent_rx) = mailbox(8);
        hub.register_agent("nas", "agent-1", None, agent_tx)
            .await
            .expect("register");
        hub.broadcast("{\"type\":\"agent_event\"}".to_string())
            .await
            .expect("broadcast");
        hub.unregister_agent("nas", "agent-1", "disconnect")
            .await
            .expect("unregister");

        let mut kinds = Vec::new();
        for _ in 0..3 {
            kinds.push(frame_type(&open_rx.recv().await.expect("frame")));
        }
        assert_eq!(kinds, vec!["agent_status", "agent_event", "agent_status"]);

        assert!(hub.remove_agent("nas").await.expect("remove"));
        assert!(hub.agent("nas").await.is_none());
        assert!(!hub.remove_agent("nas").await.expect("remove again"));
    }
}

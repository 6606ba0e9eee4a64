use fleet_core::protocol::{encode_command, AgentCommand, FrameError};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::registry::{DeliveryError, Hub};

/// Outcome handed to a waiting caller: the reply body, or the agent's error message.
pub type PendingReply = Result<Value, String>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("timed out waiting for reply {key}")]
    Timeout { key: String },
    #[error("a request with key {key} is already pending")]
    Busy { key: String },
    #[error("agent {agent_id} rejected the command: {message}")]
    Rejected { agent_id: String, message: String },
    #[error(transparent)]
    Encode(#[from] FrameError),
}

pub fn correlation_key(agent_id: &str, purpose: &str) -> String {
    format!("{agent_id}:{purpose}")
}

/// A waiting caller together with the agent it is waiting on.
struct PendingHandle {
    agent_id: String,
    reply: oneshot::Sender<PendingReply>,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    hub: Hub,
    pending: Arc<Mutex<HashMap<String, PendingHandle>>>,
    max_frame_bytes: usize,
}

impl CommandDispatcher {
    pub fn new(hub: Hub, max_frame_bytes: usize) -> Self {
        Self {
            hub,
            pending: Arc::new(Mutex::new(HashMap::new())),
            max_frame_bytes,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingHandle>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn dispatch(&self, agent_id: &str, command: &AgentCommand) -> Result<(), DispatchError> {
        let frame = encode_command(command, None, self.max_frame_bytes)?;
        self.hub.deliver(agent_id, frame).await?;
        debug!(
            event = "command_dispatched",
            agent_id = %agent_id,
            command = command.command_type(),
            job_id = command.job_id().unwrap_or_default()
        );
        Ok(())
    }

    /// Sends `command` stamped with `key` as its request id and waits for the
    /// matching reply. The handle is registered before the frame leaves so a
    /// fast reply cannot be missed.
    pub async fn dispatch_and_await(
        &self,
        agent_id: &str,
        command: &AgentCommand,
        key: &str,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let (reply, response) = oneshot::channel();
        {
            let mut pending = self.pending();
            if pending.contains_key(key) {
                return Err(DispatchError::Busy {
                    key: key.to_string(),
                });
            }
            pending.insert(
                key.to_string(),
                PendingHandle {
                    agent_id: agent_id.to_string(),
                    reply,
                },
            );
        }

        let sent = match encode_command(command, Some(key), self.max_frame_bytes) {
            Ok(frame) => self.hub.deliver(agent_id, frame).await.map_err(DispatchError::from),
            Err(err) => Err(DispatchError::from(err)),
        };
        if let Err(err) = sent {
            self.forget(key);
            return Err(err);
        }
        debug!(
            event = "command_awaiting",
            agent_id = %agent_id,
            command = command.command_type(),
            key = %key
        );

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(DispatchError::Rejected {
                agent_id: agent_id.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(DispatchError::Timeout {
                key: key.to_string(),
            }),
            Err(_) => {
                self.forget(key);
                warn!(event = "command_timeout", agent_id = %agent_id, key = %key);
                Err(DispatchError::Timeout {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Completes the handle registered under `key` if `agent_id` is the agent
    /// the request went to. Returns false when nobody waits for that agent.
    pub fn resolve(&self, agent_id: &str, key: &str, reply: PendingReply) -> bool {
        let handle = {
            let mut pending = self.pending();
            match pending.get(key) {
                Some(handle) if handle.agent_id == agent_id => pending.remove(key),
                Some(handle) => {
                    warn!(
                        event = "reply_agent_mismatch",
                        key = %key,
                        expected = %handle.agent_id,
                        responder = %agent_id
                    );
                    return false;
                }
                None => None,
            }
        };
        handle.is_some_and(|handle| handle.reply.send(reply).is_ok())
    }

    #[cfg(test)]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending().contains_key(key)
    }

    fn forget(&self, key: &str) {
        self.pending().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn hub_with_agent(agent_id: &str) -> (Hub, mpsc::Receiver<String>) {
        let hub = Hub::spawn();
        let (tx, rx) = mpsc::channel(8);
        hub.register_agent(agent_id, "agent-1", None, tx)
            .await
            .expect("register");
        (hub, rx)
    }

    fn stats_command() -> AgentCommand {
        AgentCommand::GetFolderStats {
            folder_id: "job-1".to_string(),
        }
    }

    #[tokio::test]
    async fn reply_resolves_the_stamped_request() {
        let (hub, mut rx) = hub_with_agent("nas").await;
        let dispatcher = CommandDispatcher::new(hub, 64 * 1024);
        let key = correlation_key("nas", "folder_stats:job-1");

        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let frame = rx.recv().await.expect("command frame");
                let value: Value = serde_json::from_str(&frame).expect("json");
                let request_id = value["request_id"].as_str().expect("request id").to_string();
                assert!(dispatcher.resolve("nas", &request_id, Ok(json!({"files": 3}))));
            })
        };

        let reply = dispatcher
            .dispatch_and_await("nas", &stats_command(), &key, Duration::from_secs(2))
            .await
            .expect("reply");
        assert_eq!(reply["files"], 3);
        responder.await.expect("responder");
        assert!(!dispatcher.is_pending(&key));
    }

    #[tokio::test]
    async fn timeout_removes_handle_and_second_waiter_is_busy() {
        let (hub, _rx) = hub_with_agent("nas").await;
        let dispatcher = CommandDispatcher::new(hub, 64 * 1024);
        let key = correlation_key("nas", "folder_stats:job-1");

        let first = {
            let dispatcher = dispatcher.clone();
            let key = key.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch_and_await("nas", &stats_command(), &key, Duration::from_millis(200))
                    .await
            })
        };
        while !dispatcher.is_pending(&key) {
            tokio::task::yield_now().await;
        }
        let second = dispatcher
            .dispatch_and_await("nas", &stats_command(), &key, Duration::from_millis(50))
            .await;
        assert!(matches!(second, Err(DispatchError::Busy { .. })));

        let first = first.await.expect("join");
        assert!(matches!(first, Err(DispatchError::Timeout { .. })));
        assert!(!dispatcher.is_pending(&key));
        assert!(!dispatcher.resolve("nas", &key, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn error_reply_and_delivery_failure_are_distinct() {
        let (hub, mut rx) = hub_with_agent("nas").await;
        let dispatcher = CommandDispatcher::new(hub, 64 * 1024);
        let key = correlation_key("nas", "pause_job:7");
        let command = AgentCommand::PauseJob {
            job_id: "7".to_string(),
        };

        let responder = {
            let dispatcher = dispatcher.clone();
            let key = key.clone();
            tokio::spawn(async move {
                rx.recv().await.expect("frame");
                dispatcher.resolve("nas", &key, Err("folder busy".to_string()));
            })
        };
        let rejected = dispatcher
            .dispatch_and_await("nas", &command, &key, Duration::from_secs(2))
            .await;
        match rejected {
            Err(DispatchError::Rejected { agent_id, message }) => {
                assert_eq!(agent_id, "nas");
                assert_eq!(message, "folder busy");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        responder.await.expect("responder");

        let missing = dispatcher
            .dispatch_and_await("ghost", &command, "ghost:pause_job:7", Duration::from_secs(1))
            .await;
        assert!(matches!(
            missing,
            Err(DispatchError::Delivery(DeliveryError::UnknownAgent(_)))
        ));
        assert!(!dispatcher.is_pending("ghost:pause_job:7"));
    }

    #[tokio::test]
    async fn reply_from_another_agent_leaves_the_handle_waiting() {
        let (hub, mut rx) = hub_with_agent("a").await;
        let (tx_b, _rx_b) = mpsc::channel(8);
        hub.register_agent("b", "agent-2", None, tx_b)
            .await
            .expect("register b");
        let dispatcher = CommandDispatcher::new(hub, 64 * 1024);
        let key = "a:pause_job:42".to_string();
        let command = AgentCommand::PauseJob {
            job_id: "42".to_string(),
        };

        let waiter = {
            let dispatcher = dispatcher.clone();
            let key = key.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch_and_await("a", &command, &key, Duration::from_millis(300))
                    .await
            })
        };
        rx.recv().await.expect("pause frame");

        assert!(!dispatcher.resolve("b", &key, Ok(json!({"status": "ok"}))));
        assert!(dispatcher.is_pending(&key));

        let outcome = waiter.await.expect("join");
        assert!(matches!(outcome, Err(DispatchError::Timeout { .. })));
    }
}

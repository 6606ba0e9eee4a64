use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const HUB_SENDER_ID: &str = "fleet-hub";

/// Folder identifiers are derived from job identifiers and never stored separately.
pub fn folder_id_for_job(job_id: &str) -> String {
    format!("job-{job_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SystemInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub architecture: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Reply frames from an agent. `cli_id` routes back to a console, `request_id`
/// resolves a pending correlation handle; everything else is carried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl AgentReply {
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn error_message(&self) -> String {
        ["error", "message"]
            .iter()
            .find_map(|key| self.body.get(*key).and_then(Value::as_str))
            .unwrap_or("agent reported an error")
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Register {
        device_id: String,
        #[serde(default)]
        data_dir: Option<String>,
    },
    Health {
        #[serde(default)]
        system_info: Option<SystemInfo>,
        #[serde(default)]
        data_dir: Option<String>,
    },
    Event {
        event: AgentEvent,
    },
    SessionEvent {
        event: AgentEvent,
    },
    Response(AgentReply),
    Error(AgentReply),
    BrowseResponse(AgentReply),
    BrowseError(AgentReply),
    FolderStatsResponse {
        folder_id: String,
        #[serde(default)]
        stats: Value,
        #[serde(default)]
        cli_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
    },
    FolderStatsPeriodic {
        folder_id: String,
        #[serde(default)]
        stats: Value,
    },
}

impl AgentMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Register { .. } => "register",
            AgentMessage::Health { .. } => "health",
            AgentMessage::Event { .. } => "event",
            AgentMessage::SessionEvent { .. } => "session_event",
            AgentMessage::Response(_) => "response",
            AgentMessage::Error(_) => "error",
            AgentMessage::BrowseResponse(_) => "browse_response",
            AgentMessage::BrowseError(_) => "browse_error",
            AgentMessage::FolderStatsResponse { .. } => "folder_stats_response",
            AgentMessage::FolderStatsPeriodic { .. } => "folder_stats_periodic",
        }
    }
}

/// Configuration sent to the source participant: it learns every destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDeployment {
    pub job_id: String,
    pub folder_id: String,
    pub source_agent_id: String,
    pub destination_agent_ids: Vec<String>,
    pub destination_device_ids: Vec<String>,
    pub destination_ip_addresses: Vec<String>,
    pub destination_paths: Vec<String>,
    pub source_path: String,
    pub sync_type: String,
    pub rescan_interval_s: u64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    pub is_multi_destination: bool,
}

/// Configuration sent to one destination: it only learns the source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationDeployment {
    pub job_id: String,
    pub folder_id: String,
    pub source_agent_id: String,
    pub source_device_id: String,
    pub source_ip_address: String,
    pub destination_agent_id: String,
    pub destination_path: String,
    pub sync_type: String,
    pub rescan_interval_s: u64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    pub is_multi_destination: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Deployment {
    Source(SourceDeployment),
    Destination(DestinationDeployment),
}

impl Deployment {
    pub fn job_id(&self) -> &str {
        match self {
            Deployment::Source(payload) => &payload.job_id,
            Deployment::Destination(payload) => &payload.job_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    DeployJob(Deployment),
    PauseJob {
        job_id: String,
    },
    ResumeJob {
        job_id: String,
    },
    DeleteJob {
        job_id: String,
    },
    #[serde(rename = "scan-folder")]
    ScanFolder {
        folder_id: String,
    },
    GetFolderStats {
        folder_id: String,
    },
    BrowseFolders {
        path: String,
        #[serde(default)]
        depth: u32,
    },
}

impl AgentCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            AgentCommand::DeployJob(_) => "deploy_job",
            AgentCommand::PauseJob { .. } => "pause_job",
            AgentCommand::ResumeJob { .. } => "resume_job",
            AgentCommand::DeleteJob { .. } => "delete_job",
            AgentCommand::ScanFolder { .. } => "scan-folder",
            AgentCommand::GetFolderStats { .. } => "get_folder_stats",
            AgentCommand::BrowseFolders { .. } => "browse_folders",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            AgentCommand::DeployJob(deployment) => Some(deployment.job_id()),
            AgentCommand::PauseJob { job_id }
            | AgentCommand::ResumeJob { job_id }
            | AgentCommand::DeleteJob { job_id } => Some(job_id),
            _ => None,
        }
    }
}

pub fn encode_text<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_text<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(&['\r', '\n'][..]);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Encodes a command for an agent, stamping `request_id` when a reply is awaited.
pub fn encode_command(
    command: &AgentCommand,
    request_id: Option<&str>,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    let mut value =
        serde_json::to_value(command).map_err(|err| FrameError::Encode(err.to_string()))?;
    if let (Some(request_id), Some(object)) = (request_id, value.as_object_mut()) {
        object.insert(
            "request_id".to_string(),
            Value::String(request_id.to_string()),
        );
    }
    encode_text(&value, max_frame_bytes)
}

/// A console frame is an arbitrary object addressed to one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleCommand {
    pub agent_id: String,
    pub command_type: String,
    pub fields: Map<String, Value>,
}

pub fn parse_console_command(text: &str, max_frame_bytes: usize) -> Result<ConsoleCommand, FrameError> {
    let value: Value = decode_text(text, max_frame_bytes)?;
    let Value::Object(fields) = value else {
        return Err(FrameError::Decode("console frame must be an object".to_string()));
    };
    let agent_id = fields
        .get("agent_id")
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| FrameError::Decode("missing agent_id".to_string()))?
        .to_string();
    let command_type = fields
        .get("type")
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| FrameError::Decode("missing type".to_string()))?
        .to_string();
    Ok(ConsoleCommand {
        agent_id,
        command_type,
        fields,
    })
}

impl ConsoleCommand {
    /// Stamps the originating console so agent replies can find their way back.
    pub fn stamped_for_agent(mut self, cli_id: &str) -> Value {
        self.fields
            .insert("cli_id".to_string(), Value::String(cli_id.to_string()));
        Value::Object(self.fields)
    }
}

pub fn console_error_frame(message: &str, agent_id: Option<&str>) -> Value {
    let mut payload = Map::new();
    payload.insert("type".to_string(), Value::String("error".to_string()));
    payload.insert("error".to_string(), Value::String(message.to_string()));
    payload.insert(
        "sender_id".to_string(),
        Value::String(HUB_SENDER_ID.to_string()),
    );
    if let Some(agent_id) = agent_id {
        payload.insert("agent_id".to_string(), Value::String(agent_id.to_string()));
    }
    Value::Object(payload)
}

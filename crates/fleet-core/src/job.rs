use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::protocol::folder_id_for_job;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Active,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            other => Err(format!("Unknown job status: {other}")),
        }
    }
}

/// Recurrence of a job. Unrecognized values are kept verbatim so the scheduler
/// can warn about them instead of failing the whole job load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ScheduleType {
    #[default]
    Continuous,
    Hourly,
    Daily,
    Other(String),
}

impl ScheduleType {
    pub fn as_str(&self) -> &str {
        match self {
            ScheduleType::Continuous => "continuous",
            ScheduleType::Hourly => "hourly",
            ScheduleType::Daily => "daily",
            ScheduleType::Other(value) => value.as_str(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, ScheduleType::Continuous)
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ScheduleType {
    fn from(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "" | "continuous" => ScheduleType::Continuous,
            "hourly" => ScheduleType::Hourly,
            "daily" => ScheduleType::Daily,
            _ => ScheduleType::Other(input.trim().to_string()),
        }
    }
}

impl Serialize for ScheduleType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ScheduleType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ScheduleType::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Destination {
    pub agent_id: String,
    pub path: String,
    #[serde(default = "default_destination_status")]
    pub status: String,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_synced: u64,
    #[serde(default)]
    pub bytes_synced: u64,
}

fn default_destination_status() -> String {
    "pending".to_string()
}

impl Destination {
    pub fn new(agent_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            path: path.into(),
            status: default_destination_status(),
            last_sync_at: None,
            files_synced: 0,
            bytes_synced: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub source_agent: String,
    pub source_path: String,
    pub sync_type: String,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub status: JobStatus,
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub is_multi_destination: bool,
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_s: u64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

pub fn default_rescan_interval() -> u64 {
    3600
}

pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Job {
    pub fn folder_id(&self) -> String {
        folder_id_for_job(&self.id)
    }

    /// Every agent taking part in the job, source first, then destinations in order.
    pub fn participant_ids(&self) -> Vec<String> {
        std::iter::once(self.source_agent.clone())
            .chain(self.destinations.iter().map(|dest| dest.agent_id.clone()))
            .collect()
    }

    pub fn destination(&self, agent_id: &str) -> Option<&Destination> {
        self.destinations.iter().find(|dest| dest.agent_id == agent_id)
    }
}

/// Request to create a job. Single-destination and multi-destination requests
/// collapse into the same destination list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NewJob {
    pub name: String,
    pub source_agent: String,
    pub source_path: String,
    #[serde(default = "default_sync_type")]
    pub sync_type: String,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    #[serde(default)]
    pub destination_agent: Option<String>,
    #[serde(default)]
    pub destination_path: Option<String>,
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_s: u64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

fn default_sync_type() -> String {
    "send_receive".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobValidationError {
    #[error("job name is required")]
    MissingName,
    #[error("source agent and path are required")]
    MissingSource,
    #[error("at least one destination is required")]
    NoDestinations,
    #[error("destination {0} has an empty agent id or path")]
    IncompleteDestination(usize),
    #[error("source agent {0} cannot also be a destination")]
    SourceIsDestination(String),
    #[error("destination agent {0} is listed more than once")]
    DuplicateDestination(String),
}

impl NewJob {
    pub fn resolved_destinations(&self) -> Vec<Destination> {
        if !self.destinations.is_empty() {
            return self.destinations.clone();
        }
        match (&self.destination_agent, &self.destination_path) {
            (Some(agent), Some(path)) => vec![Destination::new(agent.clone(), path.clone())],
            _ => Vec::new(),
        }
    }

    pub fn into_job(
        self,
        id: String,
        created_at: DateTime<Utc>,
    ) -> Result<Job, JobValidationError> {
        if self.name.trim().is_empty() {
            return Err(JobValidationError::MissingName);
        }
        if self.source_agent.trim().is_empty() || self.source_path.trim().is_empty() {
            return Err(JobValidationError::MissingSource);
        }
        let destinations = self.resolved_destinations();
        if destinations.is_empty() {
            return Err(JobValidationError::NoDestinations);
        }
        let mut seen = HashSet::new();
        for (index, dest) in destinations.iter().enumerate() {
            if dest.agent_id.trim().is_empty() || dest.path.trim().is_empty() {
                return Err(JobValidationError::IncompleteDestination(index));
            }
            if dest.agent_id == self.source_agent {
                return Err(JobValidationError::SourceIsDestination(dest.agent_id.clone()));
            }
            if !seen.insert(dest.agent_id.clone()) {
                return Err(JobValidationError::DuplicateDestination(dest.agent_id.clone()));
            }
        }

        Ok(Job {
            id,
            name: self.name.trim().to_string(),
            source_agent: self.source_agent,
            source_path: self.source_path,
            sync_type: self.sync_type,
            schedule_type: self.schedule_type,
            status: JobStatus::Active,
            is_multi_destination: destinations.len() > 1,
            destinations,
            rescan_interval_s: self.rescan_interval_s,
            ignore_patterns: self.ignore_patterns,
            created_at,
            last_run: None,
            next_run: None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job_id: String,
    pub source_agent: String,
    pub schedule_type: ScheduleType,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn folder_id(&self) -> String {
        folder_id_for_job(&self.job_id)
    }
}

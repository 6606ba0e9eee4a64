use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::EventRecord;
use crate::job::{Destination, Job, JobStatus, ScheduledJob};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence of job definitions and their schedule projection.
pub trait JobRepository: Send + Sync {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError>;
    fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
    fn update_status(&self, job_id: &str, status: JobStatus) -> Result<(), StoreError>;
    fn replace_destinations(
        &self,
        job_id: &str,
        destinations: &[Destination],
    ) -> Result<(), StoreError>;
    fn delete_job(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Active, recurring jobs whose `next_run` is at or before `now`.
    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, StoreError>;
    /// Active, recurring jobs that were never given a `next_run`.
    fn unscheduled_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError>;
    fn set_next_run(&self, job_id: &str, next_run: DateTime<Utc>) -> Result<(), StoreError>;
    fn record_run(
        &self,
        job_id: &str,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
}

/// Durable history of agent events.
pub trait EventSink: Send + Sync {
    fn record_event(&self, record: &EventRecord) -> Result<(), StoreError>;
    /// Most recent records of one agent, oldest first.
    fn event_history(&self, agent_id: &str, limit: usize) -> Result<Vec<EventRecord>, StoreError>;
}

use chrono::Utc;
use fleet_core::job::{new_job_id, Job, JobStatus, JobValidationError, NewJob};
use fleet_core::schedule::next_run;
use fleet_core::store::{JobRepository, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::folder_stats::FolderStatsCache;
use crate::saga::{JobSaga, SagaError};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Invalid(#[from] JobValidationError),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("agent {agent_id} is not a destination of job {job_id}")]
    UnknownDestination { job_id: String, agent_id: String },
    #[error("job {0} has a single destination left")]
    LastDestination(String),
    #[error(transparent)]
    Saga(#[from] SagaError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs a repository call on the blocking pool; the SQLite store holds a
/// mutex around a synchronous connection.
pub async fn blocking_store<T, F>(repo: &Arc<dyn JobRepository>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn JobRepository) -> Result<T, StoreError> + Send + 'static,
{
    let repo = repo.clone();
    tokio::task::spawn_blocking(move || op(repo.as_ref()))
        .await
        .map_err(|err| StoreError::Backend(format!("store task failed: {err}")))?
}

/// Job lifecycle: every change goes out to the agents first and is persisted
/// only once the saga succeeded.
#[derive(Clone)]
pub struct JobService {
    repo: Arc<dyn JobRepository>,
    saga: JobSaga,
    folder_stats: FolderStatsCache,
}

impl JobService {
    pub fn new(repo: Arc<dyn JobRepository>, saga: JobSaga, folder_stats: FolderStatsCache) -> Self {
        Self {
            repo,
            saga,
            folder_stats,
        }
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(blocking_store(&self.repo, |repo| repo.list_jobs()).await?)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, JobError> {
        let id = job_id.to_string();
        blocking_store(&self.repo, move |repo| repo.get_job(&id))
            .await?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    pub async fn create_job(&self, request: NewJob) -> Result<Job, JobError> {
        let now = Utc::now();
        let mut job = request.into_job(new_job_id(), now)?;
        self.saga.deploy(&job).await?;

        let first_run = job
            .schedule_type
            .is_recurring()
            .then(|| next_run(&job.schedule_type, None, now))
            .flatten();
        if let Some(next) = first_run {
            if next.defaulted {
                warn!(
                    event = "schedule_type_unknown",
                    job_id = %job.id,
                    schedule_type = %job.schedule_type
                );
            }
            job.next_run = Some(next.at);
        }
        let record = job.clone();
        blocking_store(&self.repo, move |repo| repo.insert_job(&record)).await?;
        info!(
            event = "job_created",
            job_id = %job.id,
            source_agent = %job.source_agent,
            destinations = job.destinations.len()
        );
        Ok(job)
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<Job, JobError> {
        self.transition(job_id, JobStatus::Paused).await
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<Job, JobError> {
        self.transition(job_id, JobStatus::Active).await
    }

    async fn transition(&self, job_id: &str, target: JobStatus) -> Result<Job, JobError> {
        let mut job = self.get_job(job_id).await?;
        if job.status == target {
            debug!(event = "job_status_unchanged", job_id = %job_id, status = %target);
            return Ok(job);
        }
        match target {
            JobStatus::Paused => self.saga.pause(&job).await?,
            JobStatus::Active => self.saga.resume(&job).await?,
        }
        let id = job_id.to_string();
        blocking_store(&self.repo, move |repo| repo.update_status(&id, target)).await?;
        job.status = target;
        info!(event = "job_status_changed", job_id = %job_id, status = %target);
        Ok(job)
    }

    pub async fn delete_job(&self, job_id: &str) -> Result<(), JobError> {
        let job = self.get_job(job_id).await?;
        self.saga.delete(&job).await?;
        let id = job_id.to_string();
        blocking_store(&self.repo, move |repo| repo.delete_job(&id)).await?;
        self.folder_stats.clear_folder(&job.folder_id());
        info!(event = "job_deleted", job_id = %job_id);
        Ok(())
    }

    pub async fn remove_destination(&self, job_id: &str, agent_id: &str) -> Result<Job, JobError> {
        let mut job = self.get_job(job_id).await?;
        if job.destination(agent_id).is_none() {
            return Err(JobError::UnknownDestination {
                job_id: job_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        if job.destinations.len() == 1 {
            return Err(JobError::LastDestination(job_id.to_string()));
        }

        self.saga.detach_destination(&job, agent_id).await?;
        job.destinations.retain(|dest| dest.agent_id != agent_id);
        job.is_multi_destination = job.destinations.len() > 1;
        let id = job_id.to_string();
        let destinations = job.destinations.clone();
        blocking_store(&self.repo, move |repo| {
            repo.replace_destinations(&id, &destinations)
        })
        .await?;
        self.folder_stats.clear(agent_id, &job.folder_id());
        info!(
            event = "job_destination_removed",
            job_id = %job_id,
            agent_id = %agent_id,
            remaining = job.destinations.len()
        );
        Ok(job)
    }
}

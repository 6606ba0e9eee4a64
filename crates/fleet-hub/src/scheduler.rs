use chrono::{DateTime, Utc};
use fleet_core::job::ScheduledJob;
use fleet_core::protocol::AgentCommand;
use fleet_core::schedule::next_run;
use fleet_core::store::{JobRepository, StoreError};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::dispatch::CommandDispatcher;
use crate::jobs::blocking_store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub triggered: usize,
    pub failed: usize,
}

/// Triggers recurring jobs. A job that fails keeps its `next_run` and is
/// picked up again on the following tick.
pub struct Scheduler {
    repo: Arc<dyn JobRepository>,
    dispatcher: CommandDispatcher,
    interval: Duration,
}

impl Scheduler {
    pub fn new(repo: Arc<dyn JobRepository>, dispatcher: CommandDispatcher, interval: Duration) -> Self {
        Self {
            repo,
            dispatcher,
            interval,
        }
    }

    /// Gives every active recurring job without a `next_run` its first slot.
    pub async fn backfill(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let unscheduled = blocking_store(&self.repo, |repo| repo.unscheduled_jobs()).await?;
        let mut slots = Vec::with_capacity(unscheduled.len());
        for job in unscheduled {
            let Some(next) = next_run(&job.schedule_type, None, now) else {
                continue;
            };
            warn_if_defaulted(&job, next.defaulted);
            slots.push((job.job_id, next.at));
        }
        let scheduled = slots.len();
        blocking_store(&self.repo, move |repo| {
            for (job_id, at) in &slots {
                repo.set_next_run(job_id, *at)?;
            }
            Ok(())
        })
        .await?;
        if scheduled > 0 {
            info!(event = "scheduler_backfill", jobs = scheduled);
        }
        Ok(scheduled)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let due = match blocking_store(&self.repo, move |repo| repo.due_jobs(now)).await {
            Ok(due) => due,
            Err(err) => {
                warn!(event = "scheduler_query_failed", error = %err);
                return report;
            }
        };

        for job in due {
            let command = AgentCommand::ScanFolder {
                folder_id: job.folder_id(),
            };
            if let Err(err) = self.dispatcher.dispatch(&job.source_agent, &command).await {
                warn!(
                    event = "scheduler_trigger_failed",
                    job_id = %job.job_id,
                    agent_id = %job.source_agent,
                    error = %err
                );
                report.failed += 1;
                continue;
            }

            let next = next_run(&job.schedule_type, Some(now), now);
            if let Some(next) = &next {
                warn_if_defaulted(&job, next.defaulted);
            }
            let job_id = job.job_id.clone();
            let next_at = next.map(|next| next.at);
            if let Err(err) = blocking_store(&self.repo, move |repo| {
                repo.record_run(&job_id, now, next_at)
            })
            .await
            {
                warn!(event = "scheduler_record_failed", job_id = %job.job_id, error = %err);
                report.failed += 1;
                continue;
            }
            info!(
                event = "scheduler_triggered",
                job_id = %job.job_id,
                agent_id = %job.source_agent
            );
            report.triggered += 1;
        }
        report
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.tick(Utc::now()).await;
                        debug!(
                            event = "scheduler_tick",
                            triggered = report.triggered,
                            failed = report.failed
                        );
                    }
                }
            }
            info!(event = "scheduler_stopped");
        })
    }
}

fn warn_if_defaulted(job: &ScheduledJob, defaulted: bool) {
    if defaulted {
        warn!(
            event = "schedule_type_unknown",
            job_id = %job.job_id,
            schedule_type = %job.schedule_type
        );
    }
}

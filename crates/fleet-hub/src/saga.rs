use fleet_core::job::Job;
use fleet_core::protocol::{
    AgentCommand, Deployment, DestinationDeployment, SourceDeployment,
};
use serde::Serialize;
use std::{fmt, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatch::{correlation_key, CommandDispatcher, DispatchError};
use crate::registry::Hub;

/// How a saga step counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The agent must reply to the stamped request within `timeout`.
    Acknowledged { timeout: Duration },
    /// A successful enqueue is enough.
    FireAndForget,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SagaAction {
    Deploy,
    Pause,
    Resume,
    Delete,
}

#[derive(Debug, Error)]
pub enum SagaError {
    #[error("participant {agent_id} of job {job_id} is not ready: {reason}")]
    ParticipantNotReady {
        job_id: String,
        agent_id: String,
        reason: &'static str,
    },
    #[error("job {job_id} failed at {role} {agent_id}: {source}")]
    StepFailed {
        job_id: String,
        agent_id: String,
        role: Role,
        #[source]
        source: DispatchError,
    },
}

#[derive(Debug, Clone)]
struct Participant {
    agent_id: String,
    role: Role,
    device_id: String,
    address: String,
    path: String,
}

/// Applies one job operation across its source and destinations, undoing the
/// confirmed steps when a later one fails.
#[derive(Clone)]
pub struct JobSaga {
    hub: Hub,
    dispatcher: CommandDispatcher,
    confirmation: Confirmation,
}

impl JobSaga {
    pub fn new(hub: Hub, dispatcher: CommandDispatcher, confirmation: Confirmation) -> Self {
        Self {
            hub,
            dispatcher,
            confirmation,
        }
    }

    pub async fn deploy(&self, job: &Job) -> Result<(), SagaError> {
        self.run(job, SagaAction::Deploy).await
    }

    pub async fn pause(&self, job: &Job) -> Result<(), SagaError> {
        self.run(job, SagaAction::Pause).await
    }

    pub async fn resume(&self, job: &Job) -> Result<(), SagaError> {
        self.run(job, SagaAction::Resume).await
    }

    pub async fn delete(&self, job: &Job) -> Result<(), SagaError> {
        self.run(job, SagaAction::Delete).await
    }

    /// Removes one destination: it drops the job, then the source is
    /// redeployed with the remaining set. If the source step fails the
    /// removed destination gets its configuration back.
    pub async fn detach_destination(&self, job: &Job, agent_id: &str) -> Result<(), SagaError> {
        let participants = self.resolve(job).await?;
        let deployments = deployments(job, &participants);
        let Some(position) = participants
            .iter()
            .position(|p| p.role == Role::Destination && p.agent_id == agent_id)
        else {
            return Err(SagaError::ParticipantNotReady {
                job_id: job.id.clone(),
                agent_id: agent_id.to_string(),
                reason: "not a destination of this job",
            });
        };
        let removed = &participants[position];

        let delete = AgentCommand::DeleteJob {
            job_id: job.id.clone(),
        };
        self.confirm(&job.id, removed, &delete).await?;

        let mut remaining = job.clone();
        remaining.destinations.retain(|dest| dest.agent_id != agent_id);
        remaining.is_multi_destination = remaining.destinations.len() > 1;
        let remaining_participants = participants
            .iter()
            .filter(|p| p.agent_id != agent_id)
            .cloned()
            .collect::<Vec<_>>();
        let source_deploy = deployments_for_source(&remaining, &remaining_participants);
        if let Err(err) = self
            .confirm(&job.id, &remaining_participants[0], &source_deploy)
            .await
        {
            self.compensate(&job.id, removed, &deployments[position]).await;
            return Err(err);
        }
        info!(
            event = "saga_destination_detached",
            job_id = %job.id,
            agent_id = %agent_id
        );
        Ok(())
    }

    async fn run(&self, job: &Job, action: SagaAction) -> Result<(), SagaError> {
        let participants = self.resolve(job).await?;
        let deploys = deployments(job, &participants);
        let forward = deploys
            .iter()
            .map(|deploy| match action {
                SagaAction::Deploy => deploy.clone(),
                SagaAction::Pause => AgentCommand::PauseJob {
                    job_id: job.id.clone(),
                },
                SagaAction::Resume => AgentCommand::ResumeJob {
                    job_id: job.id.clone(),
                },
                SagaAction::Delete => AgentCommand::DeleteJob {
                    job_id: job.id.clone(),
                },
            })
            .collect::<Vec<_>>();

        for (index, participant) in participants.iter().enumerate() {
            if let Err(err) = self.confirm(&job.id, participant, &forward[index]).await {
                warn!(
                    event = "saga_step_failed",
                    job_id = %job.id,
                    agent_id = %participant.agent_id,
                    role = %participant.role,
                    action = ?action,
                    error = %err
                );
                for done in (0..index).rev() {
                    let inverse = match action {
                        SagaAction::Deploy => AgentCommand::DeleteJob {
                            job_id: job.id.clone(),
                        },
                        SagaAction::Pause => AgentCommand::ResumeJob {
                            job_id: job.id.clone(),
                        },
                        SagaAction::Resume => AgentCommand::PauseJob {
                            job_id: job.id.clone(),
                        },
                        SagaAction::Delete => deploys[done].clone(),
                    };
                    self.compensate(&job.id, &participants[done], &inverse).await;
                }
                return Err(err);
            }
            info!(
                event = "saga_step_confirmed",
                job_id = %job.id,
                agent_id = %participant.agent_id,
                role = %participant.role,
                action = ?action
            );
        }
        Ok(())
    }

    /// Source first, then destinations in list order. Every participant must be
    /// online with a known device identity and address.
    async fn resolve(&self, job: &Job) -> Result<Vec<Participant>, SagaError> {
        let mut participants = Vec::with_capacity(job.destinations.len() + 1);
        let roles = std::iter::once((job.source_agent.as_str(), job.source_path.as_str(), Role::Source))
            .chain(
                job.destinations
                    .iter()
                    .map(|dest| (dest.agent_id.as_str(), dest.path.as_str(), Role::Destination)),
            );
        for (agent_id, path, role) in roles {
            let not_ready = |reason: &'static str| SagaError::ParticipantNotReady {
                job_id: job.id.clone(),
                agent_id: agent_id.to_string(),
                reason,
            };
            let view = self
                .hub
                .agent(agent_id)
                .await
                .ok_or_else(|| not_ready("unknown agent"))?;
            if !view.is_online {
                return Err(not_ready("agent is offline"));
            }
            let device_id = view
                .device_id
                .filter(|value| !value.is_empty())
                .ok_or_else(|| not_ready("device id not reported"))?;
            let address = view
                .address
                .filter(|value| !value.is_empty())
                .ok_or_else(|| not_ready("address unknown"))?;
            participants.push(Participant {
                agent_id: agent_id.to_string(),
                role,
                device_id,
                address,
                path: path.to_string(),
            });
        }
        Ok(participants)
    }

    async fn confirm(
        &self,
        job_id: &str,
        participant: &Participant,
        command: &AgentCommand,
    ) -> Result<(), SagaError> {
        let result = match self.confirmation {
            Confirmation::FireAndForget => {
                self.dispatcher.dispatch(&participant.agent_id, command).await
            }
            Confirmation::Acknowledged { timeout } => {
                let key = step_key(&participant.agent_id, command.command_type(), job_id);
                self.dispatcher
                    .dispatch_and_await(&participant.agent_id, command, &key, timeout)
                    .await
                    .map(|_| ())
            }
        };
        result.map_err(|source| SagaError::StepFailed {
            job_id: job_id.to_string(),
            agent_id: participant.agent_id.clone(),
            role: participant.role,
            source,
        })
    }

    async fn compensate(&self, job_id: &str, participant: &Participant, command: &AgentCommand) {
        match self.dispatcher.dispatch(&participant.agent_id, command).await {
            Ok(()) => info!(
                event = "saga_compensated",
                job_id = %job_id,
                agent_id = %participant.agent_id,
                command = command.command_type()
            ),
            Err(err) => warn!(
                event = "saga_compensation_failed",
                job_id = %job_id,
                agent_id = %participant.agent_id,
                command = command.command_type(),
                error = %err
            ),
        }
    }
}

pub fn step_key(agent_id: &str, command_type: &str, job_id: &str) -> String {
    correlation_key(agent_id, &format!("{command_type}:{job_id}"))
}

fn deployments_for_source(job: &Job, participants: &[Participant]) -> AgentCommand {
    let destinations = &participants[1..];
    AgentCommand::DeployJob(Deployment::Source(SourceDeployment {
        job_id: job.id.clone(),
        folder_id: job.folder_id(),
        source_agent_id: job.source_agent.clone(),
        destination_agent_ids: destinations.iter().map(|p| p.agent_id.clone()).collect(),
        destination_device_ids: destinations.iter().map(|p| p.device_id.clone()).collect(),
        destination_ip_addresses: destinations.iter().map(|p| p.address.clone()).collect(),
        destination_paths: destinations.iter().map(|p| p.path.clone()).collect(),
        source_path: job.source_path.clone(),
        sync_type: job.sync_type.clone(),
        rescan_interval_s: job.rescan_interval_s,
        ignore_patterns: job.ignore_patterns.clone(),
        is_multi_destination: job.is_multi_destination,
    }))
}

/// Role-specific deploy payloads, index-aligned with `participants`.
fn deployments(job: &Job, participants: &[Participant]) -> Vec<AgentCommand> {
    let source = &participants[0];
    let mut commands = vec![deployments_for_source(job, participants)];
    commands.extend(participants[1..].iter().map(|dest| {
        AgentCommand::DeployJob(Deployment::Destination(DestinationDeployment {
            job_id: job.id.clone(),
            folder_id: job.folder_id(),
            source_agent_id: source.agent_id.clone(),
            source_device_id: source.device_id.clone(),
            source_ip_address: source.address.clone(),
            destination_agent_id: dest.agent_id.clone(),
            destination_path: dest.path.clone(),
            sync_type: job.sync_type.clone(),
            rescan_interval_s: job.rescan_interval_s,
            ignore_patterns: job.ignore_patterns.clone(),
            is_multi_destination: job.is_multi_destination,
        }))
    }));
    commands
}

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PollPolicy;
use crate::error::{DashboardError, LifecycleError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Triggering,
    Polling,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Triggering => "triggering",
            JobState::Polling => "polling",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Triggering | JobState::Polling)
    }

    /// Whether the recalibrate affordance is enabled.
    pub fn can_trigger(&self) -> bool {
        !self.is_running()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobLifecycle {
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    /// Status reads that did not end the run (running or failed reads)
    pub attempts: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<DashboardError>,
}

impl JobLifecycle {
    pub fn new() -> Self {
        Self {
            state: JobState::Idle,
            started_at: None,
            attempts: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Trigger,
    TriggerAccepted { at: DateTime<Utc> },
    TriggerFailed(TransportError),
    PollRunning,
    PollCompleted,
    PollJobFailed(String),
    PollError(TransportError),
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Trigger => "trigger",
            JobEvent::TriggerAccepted { .. } => "trigger_accepted",
            JobEvent::TriggerFailed(_) => "trigger_failed",
            JobEvent::PollRunning => "poll_running",
            JobEvent::PollCompleted => "poll_completed",
            JobEvent::PollJobFailed(_) => "poll_job_failed",
            JobEvent::PollError(_) => "poll_error",
        }
    }
}

/// Apply one event to the lifecycle.
///
/// Every (state, event) pair has exactly one outcome. On `Err` the
/// lifecycle is left untouched.
pub fn apply_event(job: &mut JobLifecycle, event: JobEvent, policy: &PollPolicy) -> Result<(), LifecycleError> {
    match (job.state, event) {
        (JobState::Idle | JobState::Succeeded | JobState::Failed, JobEvent::Trigger) => {
            *job = JobLifecycle {
                state: JobState::Triggering,
                ..JobLifecycle::new()
            };
            Ok(())
        }
        (JobState::Triggering | JobState::Polling, JobEvent::Trigger) => Err(LifecycleError::AlreadyRunning),
        (JobState::Triggering, JobEvent::TriggerAccepted { at }) => {
            job.state = JobState::Polling;
            job.started_at = Some(at);
            Ok(())
        }
        (JobState::Triggering, JobEvent::TriggerFailed(err)) => {
            job.state = JobState::Failed;
            job.last_error = Some(err.into());
            Ok(())
        }
        (JobState::Polling, JobEvent::PollRunning) => {
            job.attempts += 1;
            job.consecutive_failures = 0;
            job.last_error = None;
            if job.attempts >= policy.max_polls {
                job.state = JobState::Failed;
                job.last_error = Some(LifecycleError::PollBudgetExhausted { polls: job.attempts }.into());
            }
            Ok(())
        }
        (JobState::Polling, JobEvent::PollCompleted) => {
            job.state = JobState::Succeeded;
            job.consecutive_failures = 0;
            job.last_error = None;
            Ok(())
        }
        (JobState::Polling, JobEvent::PollJobFailed(reason)) => {
            job.state = JobState::Failed;
            job.last_error = Some(LifecycleError::JobFailed { reason }.into());
            Ok(())
        }
        (JobState::Polling, JobEvent::PollError(err)) => {
            job.attempts += 1;
            job.consecutive_failures += 1;
            if job.consecutive_failures >= policy.max_attempts {
                job.state = JobState::Failed;
                job.last_error = Some(
                    LifecycleError::MaxAttemptsExceeded {
                        attempts: job.attempts,
                        last: err,
                    }
                    .into(),
                );
            } else {
                job.last_error = Some(err.into());
            }
            Ok(())
        }
        (state, other) => Err(LifecycleError::InvalidTransition {
            state: state.as_str(),
            event: other.name(),
        }),
    }
}

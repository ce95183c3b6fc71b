use serde::Serialize;
use thiserror::Error;

/// Failures of a single backend call, normalized at the gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportError {
    #[error("network unreachable: {detail}")]
    NetworkUnreachable { detail: String },
    #[error("request timed out")]
    Timeout,
    #[error("http status {code}")]
    HttpStatus { code: u16 },
    #[error("malformed response: {detail}")]
    Malformed { detail: String },
}

impl TransportError {
    pub fn unreachable(detail: impl Into<String>) -> Self {
        TransportError::NetworkUnreachable { detail: detail.into() }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        TransportError::Malformed { detail: detail.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NetworkUnreachable { .. } => "network_unreachable",
            TransportError::Timeout => "timeout",
            TransportError::HttpStatus { .. } => "http_status",
            TransportError::Malformed { .. } => "malformed",
        }
    }
}

/// Recalibration job lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleError {
    #[error("a recalibration run is already in progress")]
    AlreadyRunning,
    #[error("gave up after {attempts} status reads: {last}")]
    MaxAttemptsExceeded { attempts: u32, last: TransportError },
    #[error("run still in progress after {polls} status reads")]
    PollBudgetExhausted { polls: u32 },
    #[error("backend reported the run as failed: {reason}")]
    JobFailed { reason: String },
    #[error("dashboard session has been torn down")]
    SessionClosed,
    #[error("event {event} is not valid in state {state}")]
    InvalidTransition { state: &'static str, event: &'static str },
}

/// Anything that can end up in `JobLifecycle::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(untagged)]
pub enum DashboardError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

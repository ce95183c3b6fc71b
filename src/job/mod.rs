//! Recalibration job lifecycle controller.
//!
//! `trigger()` starts a run on the backend, then a poll task reads the
//! status endpoint after a settling delay and keeps reading with backoff
//! until the run completes, fails, or exhausts its attempts. Each run gets
//! a fresh run id; a poll whose captured run id is no longer current is
//! dropped on arrival instead of being cancelled on the wire.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::error::{DashboardError, LifecycleError, TransportError};
use crate::gateway::{Endpoint, Gateway};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::schema::{parse_status, CalibrationStatus, JobProgress};

pub mod backoff;
pub mod lifecycle;

use backoff::BackoffConfig;
use lifecycle::{apply_event, JobEvent, JobLifecycle, JobState};

#[derive(Clone, Debug, PartialEq)]
pub struct PollPolicy {
    pub settle_delay: Duration,
    pub backoff: BackoffConfig,
    /// Consecutive failed status reads tolerated before the run fails
    pub max_attempts: u32,
    /// Total status reads allowed before a still-running job is given up on
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
            max_attempts: 5,
            max_polls: 120,
        }
    }
}

/// Read-only view of the controller handed to the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub run: u64,
    pub lifecycle: JobLifecycle,
    pub status: Option<CalibrationStatus>,
}

impl JobSnapshot {
    pub fn can_trigger(&self) -> bool {
        self.lifecycle.state.can_trigger()
    }
}

struct JobShared {
    lifecycle: JobLifecycle,
    run: u64,
    status: Option<CalibrationStatus>,
    /// Sequence handed to the next status read
    status_seq: u64,
    /// Sequence of the read that produced `status`
    status_applied: u64,
    /// `last_updated` from before the current run; `None` until a status
    /// read has been seen
    baseline: Option<Option<i64>>,
    closed: bool,
}

impl JobShared {
    fn next_status_seq(&mut self) -> u64 {
        self.status_seq += 1;
        self.status_seq
    }

    fn store_status(&mut self, seq: u64, status: CalibrationStatus) -> bool {
        if self.closed || seq <= self.status_applied {
            return false;
        }
        self.status = Some(status);
        self.status_applied = seq;
        true
    }

    fn is_current_poll(&self, run: u64) -> bool {
        !self.closed && self.run == run && self.lifecycle.state == JobState::Polling
    }

    /// Apply an event and log the transition. Returns false when rejected.
    fn transition(&mut self, event: JobEvent, policy: &PollPolicy) -> bool {
        let prev = self.lifecycle.state;
        let name = event.name();
        match apply_event(&mut self.lifecycle, event, policy) {
            Ok(()) => {
                log(
                    Level::Info,
                    Domain::Job,
                    "job.transition",
                    obj(&[
                        ("run", json!(self.run)),
                        ("event", v_str(name)),
                        ("prev_state", v_str(prev.as_str())),
                        ("new_state", v_str(self.lifecycle.state.as_str())),
                        ("attempts", json!(self.lifecycle.attempts)),
                    ]),
                );
                true
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Job,
                    "job.rejected",
                    obj(&[
                        ("run", json!(self.run)),
                        ("event", v_str(name)),
                        ("state", v_str(prev.as_str())),
                        ("msg", v_str(&err.to_string())),
                    ]),
                );
                false
            }
        }
    }
}

struct Core {
    gateway: Arc<dyn Gateway>,
    policy: PollPolicy,
    shared: Mutex<JobShared>,
    changes: watch::Sender<u64>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, JobShared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v += 1);
    }

    /// Install the poll task for the current run, aborting any previous one.
    fn replace_poller(&self, handle: Option<JoinHandle<()>>) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = std::mem::replace(&mut *poller, handle) {
            previous.abort();
        }
    }

    async fn read_status(&self) -> Result<CalibrationStatus, TransportError> {
        self.gateway
            .read(Endpoint::Status, &[])
            .await
            .and_then(parse_status)
    }
}

pub struct JobController {
    core: Arc<Core>,
}

impl JobController {
    pub fn new(gateway: Arc<dyn Gateway>, policy: PollPolicy) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            core: Arc::new(Core {
                gateway,
                policy,
                shared: Mutex::new(JobShared {
                    lifecycle: JobLifecycle::new(),
                    run: 0,
                    status: None,
                    status_seq: 0,
                    status_applied: 0,
                    baseline: None,
                    closed: false,
                }),
                changes,
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let s = self.core.lock();
        JobSnapshot {
            run: s.run,
            lifecycle: s.lifecycle.clone(),
            status: s.status.clone(),
        }
    }

    pub fn state(&self) -> JobState {
        self.core.lock().lifecycle.state
    }

    /// Ticks on every applied change to the lifecycle or the held status.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.core.changes.subscribe()
    }

    /// Read calibration status without touching the lifecycle.
    ///
    /// The result becomes the held status only if no later read has already
    /// been applied.
    pub async fn fetch_status(&self) -> Result<CalibrationStatus, TransportError> {
        let seq = self.core.lock().next_status_seq();
        let outcome = self.core.read_status().await;
        if let Ok(status) = &outcome {
            let stored = self.core.lock().store_status(seq, status.clone());
            if stored {
                self.core.notify();
            } else {
                log(
                    Level::Debug,
                    Domain::Job,
                    "job.status_superseded",
                    obj(&[("seq", json!(seq))]),
                );
            }
        }
        outcome
    }

    /// Start a new recalibration run.
    ///
    /// Rejected with `AlreadyRunning` while a run is triggering or polling.
    /// A failed trigger call fails the run without entering polling. The
    /// trigger call runs on its own task, so the run settles even if the
    /// caller stops waiting.
    pub async fn trigger(&self) -> Result<u64, DashboardError> {
        let run = {
            let mut s = self.core.lock();
            if s.closed {
                return Err(LifecycleError::SessionClosed.into());
            }
            apply_event(&mut s.lifecycle, JobEvent::Trigger, &self.core.policy)?;
            s.run += 1;
            s.baseline = s.status.as_ref().map(|status| status.last_updated);
            log(
                Level::Info,
                Domain::Job,
                "job.transition",
                obj(&[
                    ("run", json!(s.run)),
                    ("event", v_str("trigger")),
                    ("new_state", v_str(s.lifecycle.state.as_str())),
                ]),
            );
            s.run
        };
        self.core.notify();

        match tokio::spawn(start_run(Arc::clone(&self.core), run)).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::SessionClosed.into()),
        }
    }

    /// Invalidate the current run and cancel any scheduled poll.
    pub fn shutdown(&self) {
        {
            let mut s = self.core.lock();
            if s.closed {
                return;
            }
            s.closed = true;
            s.run += 1;
        }
        self.core.replace_poller(None);
        log(Level::Info, Domain::System, "job.shutdown", obj(&[]));
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn start_run(core: Arc<Core>, run: u64) -> Result<u64, DashboardError> {
    let outcome = core.gateway.write(Endpoint::Trigger, None).await;

    let result = {
        let mut s = core.lock();
        if s.closed || s.run != run {
            log(
                Level::Debug,
                Domain::Job,
                "job.trigger_discarded",
                obj(&[("run", json!(run))]),
            );
            return Err(LifecycleError::SessionClosed.into());
        }
        match outcome {
            Ok(_) => {
                s.transition(JobEvent::TriggerAccepted { at: Utc::now() }, &core.policy);
                Ok(run)
            }
            Err(err) => {
                s.transition(JobEvent::TriggerFailed(err.clone()), &core.policy);
                Err(DashboardError::from(err))
            }
        }
    };
    core.notify();

    if result.is_ok() {
        let handle = tokio::spawn(poll_loop(Arc::clone(&core), run));
        core.replace_poller(Some(handle));
    }
    result
}

async fn poll_loop(core: Arc<Core>, run: u64) {
    let mut delay = core.policy.settle_delay;
    loop {
        sleep(delay).await;

        let seq = {
            let mut s = core.lock();
            if !s.is_current_poll(run) {
                return;
            }
            s.next_status_seq()
        };

        let outcome = core.read_status().await;

        let next_delay = {
            let mut s = core.lock();
            if !s.is_current_poll(run) {
                log(
                    Level::Debug,
                    Domain::Job,
                    "job.poll_discarded",
                    obj(&[("run", json!(run)), ("current_run", json!(s.run))]),
                );
                return;
            }
            let event = match outcome {
                Ok(status) => {
                    let baseline = s.baseline;
                    let progress = match baseline {
                        Some(previous) => status.progress(previous),
                        None => {
                            // first sight of the status: later reads compare against it
                            s.baseline = Some(status.last_updated);
                            status.reported_progress().unwrap_or(JobProgress::Running)
                        }
                    };
                    let event = match progress {
                        JobProgress::Running => JobEvent::PollRunning,
                        JobProgress::Completed => JobEvent::PollCompleted,
                        JobProgress::Failed(reason) => JobEvent::PollJobFailed(reason),
                    };
                    s.store_status(seq, status);
                    event
                }
                Err(err) => JobEvent::PollError(err),
            };
            s.transition(event, &core.policy);
            if s.lifecycle.state == JobState::Polling {
                Some(core.policy.backoff.delay_for_attempt(s.lifecycle.attempts.saturating_sub(1)))
            } else {
                None
            }
        };
        core.notify();

        match next_delay {
            Some(d) => delay = d,
            None => return,
        }
    }
}

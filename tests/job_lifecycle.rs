//! Recalibration lifecycle driven end to end through a scripted backend.
//!
//! Time is paused, so the settle delay and poll backoff advance only when
//! every task is idle. Policy: 5s settle, then one poll per second.

use std::sync::Arc;
use std::time::Duration;

use calibration_dashboard::job::backoff::BackoffConfig;
use calibration_dashboard::{
    DashboardError, Endpoint, JobController, JobState, LifecycleError, PollPolicy, ScriptedGateway,
    TransportError,
};
use serde_json::{json, Value};
use tokio::time::sleep;

fn policy(max_attempts: u32) -> PollPolicy {
    PollPolicy {
        settle_delay: Duration::from_secs(5),
        backoff: BackoffConfig {
            base_delay_ms: 1000,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        },
        max_attempts,
        max_polls: 100,
    }
}

fn job_status(state: &str) -> Value {
    json!({
        "last_updated": 1700000000,
        "features": [{"name": "maternal_age", "distribution_family": "normal",
                      "params": {"mu": 28.5, "sigma": 4.2}, "source_label": "NCHS Natality 2023"}],
        "job": {"state": state}
    })
}

fn accepting_gateway() -> Arc<ScriptedGateway> {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_fallback(Endpoint::Trigger, Ok(Value::Null));
    gw
}

#[tokio::test(start_paused = true)]
async fn three_running_polls_then_completion() {
    let gw = accepting_gateway();
    for _ in 0..3 {
        gw.push(Endpoint::Status, &[], Ok(job_status("running")));
    }
    gw.push(Endpoint::Status, &[], Ok(job_status("completed")));
    let ctl = JobController::new(gw.clone(), policy(5));

    let mut seen = vec![ctl.state()];
    ctl.trigger().await.unwrap();
    seen.push(ctl.state());

    // polls land at 5s, 6s, 7s, 8s
    sleep(Duration::from_millis(5500)).await;
    seen.push(ctl.state());
    assert_eq!(ctl.snapshot().lifecycle.attempts, 1);
    sleep(Duration::from_secs(1)).await;
    seen.push(ctl.state());
    sleep(Duration::from_secs(1)).await;
    seen.push(ctl.state());
    assert_eq!(ctl.snapshot().lifecycle.attempts, 3);
    sleep(Duration::from_secs(1)).await;
    seen.push(ctl.state());

    assert_eq!(
        seen,
        vec![
            JobState::Idle,
            JobState::Polling,
            JobState::Polling,
            JobState::Polling,
            JobState::Polling,
            JobState::Succeeded,
        ]
    );
    assert_eq!(gw.calls(Endpoint::Status), 4);

    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.attempts, 3);
    assert!(snap.lifecycle.started_at.is_some());
    assert_eq!(snap.lifecycle.last_error, None);
    assert_eq!(snap.status.as_ref().unwrap().features[0].name, "maternal_age");
    assert!(snap.can_trigger());

    // nothing else is scheduled after a terminal state
    sleep(Duration::from_secs(60)).await;
    assert_eq!(gw.calls(Endpoint::Status), 4);
}

#[tokio::test(start_paused = true)]
async fn trigger_http_500_fails_without_polling() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.set_fallback(Endpoint::Trigger, Err(TransportError::HttpStatus { code: 500 }));
    gw.set_fallback(Endpoint::Status, Ok(job_status("completed")));
    let ctl = JobController::new(gw.clone(), policy(5));

    let err = ctl.trigger().await.unwrap_err();
    assert_eq!(err, DashboardError::Transport(TransportError::HttpStatus { code: 500 }));

    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Failed);
    assert_eq!(snap.lifecycle.attempts, 0);
    assert_eq!(
        snap.lifecycle.last_error,
        Some(DashboardError::Transport(TransportError::HttpStatus { code: 500 }))
    );
    assert!(snap.can_trigger());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(gw.calls(Endpoint::Status), 0);
}

#[tokio::test(start_paused = true)]
async fn trigger_while_polling_is_rejected_and_state_unchanged() {
    let gw = accepting_gateway();
    gw.set_fallback(Endpoint::Status, Ok(job_status("running")));
    let ctl = JobController::new(gw.clone(), policy(5));

    let run = ctl.trigger().await.unwrap();
    sleep(Duration::from_millis(6500)).await;
    let before = ctl.snapshot();
    assert_eq!(before.lifecycle.state, JobState::Polling);
    assert!(!before.can_trigger());

    let err = ctl.trigger().await.unwrap_err();
    assert_eq!(err, DashboardError::Lifecycle(LifecycleError::AlreadyRunning));
    assert_eq!(ctl.snapshot(), before);
    assert_eq!(ctl.snapshot().run, run);
    assert_eq!(gw.calls(Endpoint::Trigger), 1);
}

#[tokio::test(start_paused = true)]
async fn trigger_while_triggering_is_rejected() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.push_delayed(Endpoint::Trigger, &[], Duration::from_secs(2), Ok(Value::Null));
    gw.set_fallback(Endpoint::Status, Ok(job_status("completed")));
    let ctl = Arc::new(JobController::new(gw.clone(), policy(5)));

    let first = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.trigger().await }
    });
    tokio::task::yield_now().await;
    assert_eq!(ctl.state(), JobState::Triggering);

    let err = ctl.trigger().await.unwrap_err();
    assert_eq!(err, DashboardError::Lifecycle(LifecycleError::AlreadyRunning));

    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert_eq!(ctl.state(), JobState::Polling);
    assert_eq!(gw.calls(Endpoint::Trigger), 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_read_failures_fail_the_run_and_stop_polling() {
    let gw = accepting_gateway();
    gw.set_fallback(Endpoint::Status, Err(TransportError::Timeout));
    let ctl = JobController::new(gw.clone(), policy(3));

    ctl.trigger().await.unwrap();
    sleep(Duration::from_millis(5500)).await;
    assert_eq!(ctl.state(), JobState::Polling);
    assert_eq!(
        ctl.snapshot().lifecycle.last_error,
        Some(DashboardError::Transport(TransportError::Timeout))
    );

    sleep(Duration::from_secs(3)).await;
    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Failed);
    assert_eq!(snap.lifecycle.attempts, 3);
    assert_eq!(
        snap.lifecycle.last_error,
        Some(DashboardError::Lifecycle(LifecycleError::MaxAttemptsExceeded {
            attempts: 3,
            last: TransportError::Timeout,
        }))
    );

    sleep(Duration::from_secs(600)).await;
    assert_eq!(gw.calls(Endpoint::Status), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_read_failure_is_retried() {
    let gw = accepting_gateway();
    gw.push(Endpoint::Status, &[], Err(TransportError::unreachable("connection reset")));
    gw.push(Endpoint::Status, &[], Ok(job_status("completed")));
    let ctl = JobController::new(gw.clone(), policy(3));

    ctl.trigger().await.unwrap();
    sleep(Duration::from_secs(10)).await;
    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Succeeded);
    assert_eq!(snap.lifecycle.attempts, 1);
    assert_eq!(snap.lifecycle.last_error, None);
    assert_eq!(gw.calls(Endpoint::Status), 2);
}

#[tokio::test(start_paused = true)]
async fn backend_reported_failure_is_terminal() {
    let gw = accepting_gateway();
    gw.push(
        Endpoint::Status,
        &[],
        Ok(json!({"last_updated": null, "features": [], "job": {"state": "failed", "error": "CDC WONDER query failed"}})),
    );
    let ctl = JobController::new(gw.clone(), policy(3));

    ctl.trigger().await.unwrap();
    sleep(Duration::from_secs(6)).await;
    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Failed);
    assert_eq!(
        snap.lifecycle.last_error,
        Some(DashboardError::Lifecycle(LifecycleError::JobFailed {
            reason: "CDC WONDER query failed".to_string()
        }))
    );
}

fn bare_status(last_updated: i64) -> Value {
    json!({"last_updated": last_updated, "features": []})
}

#[tokio::test(start_paused = true)]
async fn unchanged_last_updated_is_not_completion() {
    let gw = accepting_gateway();
    // a run that finished "now" by the server clock, before this trigger
    let previous = chrono::Utc::now().timestamp();
    gw.push(Endpoint::Status, &[], Ok(bare_status(previous)));
    gw.set_fallback(Endpoint::Status, Ok(bare_status(previous)));
    let ctl = JobController::new(gw.clone(), policy(3));
    ctl.fetch_status().await.unwrap();

    ctl.trigger().await.unwrap();
    sleep(Duration::from_millis(7500)).await;
    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Polling);
    assert_eq!(snap.lifecycle.attempts, 3);

    gw.push(Endpoint::Status, &[], Ok(bare_status(previous + 1)));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ctl.state(), JobState::Succeeded);
    assert_eq!(ctl.snapshot().status.unwrap().last_updated, Some(previous + 1));
}

#[tokio::test(start_paused = true)]
async fn server_clock_behind_client_still_completes() {
    let gw = accepting_gateway();
    gw.push(Endpoint::Status, &[], Ok(bare_status(1_000)));
    gw.push(Endpoint::Status, &[], Ok(bare_status(1_000)));
    gw.push(Endpoint::Status, &[], Ok(bare_status(1_060)));
    let ctl = JobController::new(gw.clone(), policy(3));
    ctl.fetch_status().await.unwrap();

    ctl.trigger().await.unwrap();
    sleep(Duration::from_millis(5500)).await;
    assert_eq!(ctl.state(), JobState::Polling);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ctl.state(), JobState::Succeeded);
    assert_eq!(gw.calls(Endpoint::Status), 3);
}

#[tokio::test(start_paused = true)]
async fn first_poll_sets_baseline_when_status_never_read() {
    let gw = accepting_gateway();
    gw.push(Endpoint::Status, &[], Ok(bare_status(1_700_000_000)));
    gw.push(Endpoint::Status, &[], Ok(bare_status(1_700_000_000)));
    gw.push(Endpoint::Status, &[], Ok(bare_status(1_700_000_900)));
    let ctl = JobController::new(gw.clone(), policy(3));

    ctl.trigger().await.unwrap();
    sleep(Duration::from_millis(6500)).await;
    assert_eq!(ctl.state(), JobState::Polling);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ctl.state(), JobState::Succeeded);
    assert_eq!(ctl.snapshot().lifecycle.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn abandoned_trigger_call_still_settles_the_run() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.push_delayed(Endpoint::Trigger, &[], Duration::from_secs(10), Ok(Value::Null));
    gw.set_fallback(Endpoint::Trigger, Ok(Value::Null));
    gw.set_fallback(Endpoint::Status, Ok(job_status("completed")));
    let ctl = JobController::new(gw.clone(), policy(3));

    let waited = tokio::time::timeout(Duration::from_secs(1), ctl.trigger()).await;
    assert!(waited.is_err());
    assert_eq!(ctl.state(), JobState::Triggering);

    // the trigger call lands at 10s, the first poll at 15s
    sleep(Duration::from_secs(120)).await;
    assert_eq!(ctl.state(), JobState::Succeeded);
    assert!(ctl.snapshot().can_trigger());

    let again = ctl.trigger().await.unwrap();
    assert_eq!(again, 2);
    assert_eq!(gw.calls(Endpoint::Trigger), 2);
}

#[tokio::test(start_paused = true)]
async fn abandoned_failing_trigger_reenables_trigger() {
    let gw = Arc::new(ScriptedGateway::new());
    gw.push_delayed(
        Endpoint::Trigger,
        &[],
        Duration::from_secs(10),
        Err(TransportError::HttpStatus { code: 503 }),
    );
    let ctl = JobController::new(gw.clone(), policy(3));

    let waited = tokio::time::timeout(Duration::from_secs(1), ctl.trigger()).await;
    assert!(waited.is_err());

    sleep(Duration::from_secs(20)).await;
    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Failed);
    assert_eq!(
        snap.lifecycle.last_error,
        Some(DashboardError::Transport(TransportError::HttpStatus { code: 503 }))
    );
    assert!(snap.can_trigger());
    assert_eq!(gw.calls(Endpoint::Status), 0);
}

#[tokio::test(start_paused = true)]
async fn new_run_after_failure_resets_attempts() {
    let gw = accepting_gateway();
    for _ in 0..2 {
        gw.push(Endpoint::Status, &[], Err(TransportError::Timeout));
    }
    gw.push(Endpoint::Status, &[], Ok(job_status("running")));
    gw.push(Endpoint::Status, &[], Ok(job_status("completed")));
    let ctl = JobController::new(gw.clone(), policy(2));

    let first = ctl.trigger().await.unwrap();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(ctl.state(), JobState::Failed);
    assert_eq!(ctl.snapshot().lifecycle.attempts, 2);

    let second = ctl.trigger().await.unwrap();
    assert!(second > first);
    let fresh = ctl.snapshot();
    assert_eq!(fresh.lifecycle.state, JobState::Polling);
    assert_eq!(fresh.lifecycle.attempts, 0);
    assert_eq!(fresh.lifecycle.last_error, None);

    sleep(Duration::from_secs(10)).await;
    let done = ctl.snapshot();
    assert_eq!(done.lifecycle.state, JobState::Succeeded);
    assert_eq!(done.lifecycle.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_in_flight_poll() {
    let gw = accepting_gateway();
    gw.push_delayed(Endpoint::Status, &[], Duration::from_secs(3), Ok(job_status("completed")));
    let ctl = JobController::new(gw.clone(), policy(3));

    ctl.trigger().await.unwrap();
    // first read goes out at 5s and would answer at 8s
    sleep(Duration::from_secs(6)).await;
    assert_eq!(gw.calls(Endpoint::Status), 1);
    ctl.shutdown();

    sleep(Duration::from_secs(60)).await;
    let snap = ctl.snapshot();
    assert_eq!(snap.lifecycle.state, JobState::Polling);
    assert_eq!(snap.status, None);
    assert_eq!(gw.calls(Endpoint::Status), 1);
}

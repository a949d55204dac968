// tests/lifecycle_tests.rs
//
// Full-lifecycle scenarios against the simulated provider, under tokio's
// paused clock: the spec-level cadences (30 s polls, 60 s backoff, 10 min
// readiness timeout) elapse in virtual time.

mod common;

use common::{harness, harness_with, small_request, wait_for_job, wait_for_terminal};
use std::time::Duration;

use gpuflow::core::JobStatus;
use gpuflow::providers::local::InjectKind;

/// Terminal jobs must not leak their rental: the referenced instance is
/// terminalised by the time the job settles (the runner bounds this at
/// 10 s).
fn assert_instance_settled(h: &common::Harness, job: &gpuflow::core::Job) {
    let Some(instance_id) = job.instance_id else {
        return;
    };
    let instance = h.store.get_instance(instance_id).unwrap().unwrap();
    assert!(
        instance.status.is_terminal(),
        "instance {} leaked in {}",
        instance.id,
        instance.status
    );
    assert!(instance.stopped_at.is_some());
}

/// Budget guard: a job can never be billed for more than its runtime
/// ceiling (plus the 10% grace), within a cent.
fn assert_cost_bounded(job: &gpuflow::core::Job, hourly: f64) {
    let ceiling = hourly * (job.max_runtime_minutes as f64 * 1.1) / 60.0 + 0.01;
    let actual = job.actual_cost_usd.expect("terminal job carries a cost");
    assert!(
        actual <= ceiling,
        "billed ${actual} over the ${ceiling} ceiling"
    );
}

#[tokio::test(start_paused = true)]
async fn submit_runs_to_completion() {
    let h = harness();
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();
    assert_eq!(ticket.status, JobStatus::Queued);
    assert!(ticket.estimated_cost_usd > 0.0);

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert_eq!(job.progress_percent, 100.0);
    assert!(job.output.is_some());
    assert!(job.error_message.is_none());

    // Timestamp ordering: assigned <= started <= completed.
    let assigned = job.assigned_at.unwrap();
    let started = job.started_at.unwrap();
    let completed = job.completed_at.unwrap();
    assert!(assigned <= started && started <= completed);
    assert!(job.estimated_completion_at.is_some());

    assert_instance_settled(&h, &job);
    assert_cost_bounded(&job, 0.5);
}

#[tokio::test(start_paused = true)]
async fn stuck_startup_times_out_and_bills_nothing() {
    // Short readiness window: same timeout path, fewer virtual polls.
    let h = harness_with(|s| s.readiness_timeout = Duration::from_secs(10));
    h.provider.stick_in_starting(true);
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error_message.as_deref().unwrap_or("").contains("instance startup timeout"),
        "got error: {:?}",
        job.error_message
    );
    // Never reached RUNNING: nothing billed.
    assert_eq!(job.actual_cost_usd, Some(0.0));
    assert_instance_settled(&h, &job);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_run_is_idempotent() {
    let h = harness();
    // Long enough that the job is still running when we cancel.
    h.workload.set_duration(Duration::from_secs(3600));
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(120))
        .await
        .unwrap();
    wait_for_job(&h, h.user, ticket.job_id, "running", |j| {
        j.status == JobStatus::Running
    })
    .await;

    h.orchestrator.cancel_job(h.user, ticket.job_id).unwrap();
    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
    assert_instance_settled(&h, &job);
    assert_cost_bounded(&job, 0.5);

    // Second cancel: same terminal state, no further mutation.
    let second = h.orchestrator.cancel_job(h.user, ticket.job_id).unwrap();
    assert_eq!(second, JobStatus::Cancelled);
    let after = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();
    assert_eq!(after.completed_at, job.completed_at);
    assert_eq!(after.version, job.version);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_queued_never_rents_anything() {
    let h = harness();
    // Not started: the job can only sit in the queue.
    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let status = h.orchestrator.cancel_job(h.user, ticket.job_id).unwrap();
    assert_eq!(status, JobStatus::Queued, "status at call time");

    let job = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.actual_cost_usd, Some(0.0));
    assert!(job.instance_id.is_none());
    assert_eq!(h.provider.created_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_create_failure_retries_then_succeeds() {
    let h = harness();
    h.provider.inject_create_failures(1, InjectKind::Transient);
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert_eq!(job.retry_count, 1, "one transient failure, one retry");
    assert_eq!(h.provider.created_total(), 1);
    assert_instance_settled(&h, &job);
}

#[tokio::test(start_paused = true)]
async fn permanent_create_failure_never_retries() {
    let h = harness();
    h.provider.inject_create_failures(1, InjectKind::Permanent);
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(
        job.error_message.as_deref().unwrap_or("").contains("PROVIDER_PERMANENT"),
        "got error: {:?}",
        job.error_message
    );
    assert_eq!(job.actual_cost_usd, Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_exhaust_the_retry_budget() {
    let h = harness();
    h.provider.inject_create_failures(4, InjectKind::Transient);
    h.orchestrator.start();

    // Default max_retries = 3: attempts 1+3, all failing.
    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(h.provider.created_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_records_a_backoff_window() {
    let h = harness();
    h.provider.inject_create_failures(1, InjectKind::Insufficient);
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let job = wait_for_job(&h, h.user, ticket.job_id, "first retry", |j| {
        j.retry_count == 1
    })
    .await;
    assert!(job.backoff_until.is_some(), "requeue carries its backoff stamp");

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn workload_failure_is_terminal() {
    let h = harness();
    h.workload.fail_with("exit code 1");
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error_message.as_deref().unwrap_or("").contains("workload failed"),
        "got error: {:?}",
        job.error_message
    );
    assert_instance_settled(&h, &job);
}

#[tokio::test(start_paused = true)]
async fn overlong_workload_hits_the_wall_clock_deadline() {
    let h = harness();
    // 1 minute of budget, hours of work.
    h.workload.set_duration(Duration::from_secs(7200));
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(1))
        .await
        .unwrap();

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Timeout);
    assert!(
        job.error_message.as_deref().unwrap_or("").contains("wall clock"),
        "got error: {:?}",
        job.error_message
    );
    assert_instance_settled(&h, &job);
    assert_cost_bounded(&job, 0.5);
}

#[tokio::test(start_paused = true)]
async fn instance_death_mid_run_burns_a_retry() {
    let h = harness();
    h.workload.set_duration(Duration::from_secs(1800));
    h.orchestrator.start();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();
    let running = wait_for_job(&h, h.user, ticket.job_id, "running", |j| {
        j.status == JobStatus::Running
    })
    .await;

    // Kill the box under the job; the monitor notices and the runner
    // requeues on the provider-fault path.
    let instance = h
        .store
        .get_instance(running.instance_id.unwrap())
        .unwrap()
        .unwrap();
    h.provider.mark_failed(&instance.provider_instance_id);
    // The retry should run on a healthy box.
    h.workload.set_duration(Duration::from_millis(50));

    let job = wait_for_terminal(&h, h.user, ticket.job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert!(job.retry_count >= 1);
    assert_instance_settled(&h, &job);
}

#[tokio::test(start_paused = true)]
async fn other_users_cannot_see_or_cancel_a_job() {
    let h = harness();
    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();

    let stranger = gpuflow::core::Principal {
        user_id: uuid::Uuid::new_v4(),
    };
    assert!(h.orchestrator.get_job(stranger, ticket.job_id).unwrap().is_none());
    assert!(h.orchestrator.cancel_job(stranger, ticket.job_id).is_err());
}

// src/runner.rs
//
// =============================================================================
// GPUFLOW: JOB RUNNER
// =============================================================================
//
// One task per dispatched job, owning every transition that job makes:
//
//   QUEUED -> ASSIGNED -> RUNNING -> {COMPLETED, FAILED, CANCELLED, TIMEOUT}
//
// The runner asks the planner for a placement, rents the box, spawns the
// instance monitor, waits for readiness, drives the workload under the
// wall-clock deadline, and settles cost atomically with the terminal
// status write. Transient failures requeue with exponential backoff while
// retry budget remains; CANCELLED and TIMEOUT never retry.
//
// Every status write is guarded by the store's optimistic version check
// and retried up to three times on conflict. Losing the race to a
// terminal status (a concurrent cancel) aborts the lifecycle and tears
// the instance down.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use uuid::Uuid;

use crate::core::{Instance, InstanceStatus, Job, JobStatus, LaunchOptions};
use crate::error::{OrchestratorError, Result};
use crate::monitor::InstanceMonitor;
use crate::orchestrator::OrchCtx;
use crate::providers::util::idempotency_token;
use crate::providers::GpuProvider;

/// First retry delay; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(60);
/// Backoff ceiling (10 minutes).
const BACKOFF_CAP: Duration = Duration::from_secs(600);
/// Guarded-write attempts before giving up on a conflicted row.
const WRITE_ATTEMPTS: u32 = 3;
/// How long teardown waits for the monitor to observe the terminal state.
const TEARDOWN_SETTLE: Duration = Duration::from_secs(10);

pub struct JobRunner;

/// What the lifecycle decided; `drive` converts this into the terminal write.
enum RunOutcome {
    Completed(Value),
    Failed { message: String, transient: bool },
    Cancelled,
    Timeout,
}

impl JobRunner {
    /// Entry point, spawned by the scheduler. The dispatch permit is held
    /// by the caller's task for exactly this call's duration.
    pub async fn run(ctx: Arc<OrchCtx>, job_id: Uuid, mut cancel: watch::Receiver<bool>) {
        if let Err(e) = Self::drive(&ctx, job_id, &mut cancel).await {
            log::error!("runner: job {job_id} aborted: {e}");
        }
        ctx.active_runners.lock().unwrap().remove(&job_id);
    }

    async fn drive(
        ctx: &Arc<OrchCtx>,
        job_id: Uuid,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut job = match ctx.store.get_job(job_id)? {
            Some(j) => j,
            None => return Err(OrchestratorError::Internal(format!("job {job_id} missing"))),
        };
        if job.status != JobStatus::Queued {
            // Dispatched twice or terminalised while waiting; nothing to do.
            return Ok(());
        }
        if *cancel.borrow() {
            return Self::terminalise(ctx, &mut job, JobStatus::Cancelled, None, None, 0.0);
        }

        // --- 1. PLACEMENT ---------------------------------------------------
        // Providers over their own instance cap, over this user's
        // per-provider allowance, or outside the user's allow-list never
        // become candidates.
        let quota = ctx.admission.effective_quota(job.user_id)?;
        let user_id = job.user_id;
        let allow = |provider| {
            if !quota.allows_provider(provider) {
                return false;
            }
            let global_cap = ctx
                .registry
                .all()
                .iter()
                .find(|e| e.settings.provider == provider)
                .map(|e| e.settings.max_instances)
                .unwrap_or(0) as u64;
            let global_live = ctx.store.count_live_instances_on(provider).unwrap_or(u64::MAX);
            if global_live >= global_cap {
                return false;
            }
            let user_live = ctx
                .store
                .count_user_instances_on(user_id, provider)
                .unwrap_or(u64::MAX);
            user_live < quota.max_instances_per_provider as u64
        };

        let placement = match ctx.planner.plan(&ctx.registry, &job, allow).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                let msg = format!(
                    "no provider can place {}x{} within budget",
                    job.gpu_count, job.gpu_type
                );
                log::warn!("runner: job {job_id}: {msg}");
                return Self::terminalise(
                    ctx,
                    &mut job,
                    JobStatus::Failed,
                    Some(format!("NO_PLACEMENT: {msg}")),
                    None,
                    0.0,
                );
            }
            Err(e) => return Self::fail_or_retry(ctx, &mut job, e).await,
        };

        let adapter = ctx.registry.adapter(placement.provider).ok_or_else(|| {
            OrchestratorError::Internal(format!("no adapter for {}", placement.provider))
        })?;

        // --- 2. CREATE INSTANCE ---------------------------------------------
        let opts = LaunchOptions {
            region: placement.region.clone(),
            storage_gb: None,
            container_disk_gb: None,
            use_spot: true,
            api_endpoint: None,
        };
        let token = idempotency_token(job.id, job.retry_count);

        let instance = match adapter
            .create_instance(&job, placement.gpu_type, placement.gpu_count, &opts, &token)
            .await
        {
            Ok(i) => i,
            Err(e) => return Self::fail_or_retry(ctx, &mut job, e).await,
        };
        ctx.store.insert_instance(&instance)?;

        // --- 3. QUEUED -> ASSIGNED ------------------------------------------
        let instance_id = instance.id;
        let assigned = Self::commit(ctx, &mut job, |j| {
            j.status = JobStatus::Assigned;
            j.assigned_at = Some(Utc::now());
            j.instance_id = Some(instance_id);
        })?;
        if !assigned {
            // Lost to a concurrent terminal write (cancel). Clean up the box.
            Self::teardown_instance(ctx, adapter.as_ref(), instance_id).await;
            return Ok(());
        }

        let mut status_rx = InstanceMonitor::spawn(
            ctx.store.clone(),
            adapter.clone(),
            instance_id,
            ctx.settings.instance_poll_interval,
            ctx.shutdown.subscribe(),
        );

        // --- 4. READINESS WAIT ----------------------------------------------
        let outcome = tokio::select! {
            ready = wait_for_status(&mut status_rx, |s| {
                s == InstanceStatus::Running || s.is_terminal()
            }) => match ready {
                Some(InstanceStatus::Running) => None,
                Some(terminal) => Some(RunOutcome::Failed {
                    message: format!("instance failed during startup ({terminal})"),
                    transient: true,
                }),
                // Monitor died; treat as a provider fault.
                None => Some(RunOutcome::Failed {
                    message: "instance monitor lost".to_string(),
                    transient: true,
                }),
            },
            _ = cancelled(cancel) => Some(RunOutcome::Cancelled),
            _ = sleep(ctx.settings.readiness_timeout) => Some(RunOutcome::Failed {
                message: "instance startup timeout".to_string(),
                transient: false,
            }),
        };

        if let Some(outcome) = outcome {
            let cost = Self::teardown_instance(ctx, adapter.as_ref(), instance_id).await;
            return Self::settle(ctx, &mut job, outcome, cost).await;
        }

        // --- 5. ASSIGNED -> RUNNING -----------------------------------------
        let started = Utc::now();
        let eta = started + ChronoDuration::minutes(job.max_runtime_minutes as i64);
        let running = Self::commit(ctx, &mut job, |j| {
            j.status = JobStatus::Running;
            j.started_at = Some(started);
            j.estimated_completion_at = Some(eta);
        })?;
        if !running {
            Self::teardown_instance(ctx, adapter.as_ref(), instance_id).await;
            return Ok(());
        }
        log::info!(
            "job {job_id} running on {} ({}), deadline {}s",
            placement.provider,
            instance.provider_instance_id,
            job.run_deadline_secs()
        );

        // --- 6. EXECUTE UNDER DEADLINE --------------------------------------
        let live = ctx
            .store
            .get_instance(instance_id)?
            .unwrap_or(instance);
        let deadline = Duration::from_secs(job.run_deadline_secs());

        let outcome = tokio::select! {
            result = ctx.workload.execute(&job, &live) => match result {
                Ok(output) => RunOutcome::Completed(output),
                Err(e) => RunOutcome::Failed {
                    message: e.to_string(),
                    transient: false,
                },
            },
            changed = wait_for_status(&mut status_rx, |s| s.is_terminal()) => {
                let status = changed.unwrap_or(InstanceStatus::Failed);
                // The box died under us: a provider fault, so retry budget
                // applies. Workload exit failures below do not.
                RunOutcome::Failed {
                    message: format!("instance {status} while job was running"),
                    transient: true,
                }
            }
            _ = cancelled(cancel) => RunOutcome::Cancelled,
            _ = sleep(deadline) => RunOutcome::Timeout,
        };

        // --- 7. TEARDOWN & SETTLE -------------------------------------------
        let cost = Self::teardown_instance(ctx, adapter.as_ref(), instance_id).await;
        Self::settle(ctx, &mut job, outcome, cost).await
    }

    // -------------------------------------------------------------------------
    // Outcome handling
    // -------------------------------------------------------------------------

    async fn settle(
        ctx: &Arc<OrchCtx>,
        job: &mut Job,
        outcome: RunOutcome,
        actual_cost: f64,
    ) -> Result<()> {
        match outcome {
            RunOutcome::Completed(output) => {
                Self::terminalise(
                    ctx,
                    job,
                    JobStatus::Completed,
                    None,
                    Some(output),
                    actual_cost,
                )
            }
            RunOutcome::Cancelled => {
                Self::terminalise(ctx, job, JobStatus::Cancelled, None, None, actual_cost)
            }
            RunOutcome::Timeout => {
                let message = format!(
                    "wall clock exceeded {} minutes (+10% grace)",
                    job.max_runtime_minutes
                );
                Self::terminalise(ctx, job, JobStatus::Timeout, Some(message), None, actual_cost)
            }
            RunOutcome::Failed { message, transient } => {
                if transient && job.retry_count < job.max_retries {
                    Self::requeue_with_backoff(ctx, job, &message)
                } else {
                    Self::terminalise(
                        ctx,
                        job,
                        JobStatus::Failed,
                        Some(message),
                        None,
                        actual_cost,
                    )
                }
            }
        }
    }

    /// Create-phase failures: transient classes burn a retry, permanent
    /// classes terminalise immediately.
    async fn fail_or_retry(
        ctx: &Arc<OrchCtx>,
        job: &mut Job,
        error: OrchestratorError,
    ) -> Result<()> {
        if error.is_transient() && job.retry_count < job.max_retries {
            Self::requeue_with_backoff(ctx, job, &error.to_string())
        } else {
            Self::terminalise(
                ctx,
                job,
                JobStatus::Failed,
                Some(format!("{}: {error}", error.class())),
                None,
                0.0,
            )
        }
    }

    fn requeue_with_backoff(ctx: &Arc<OrchCtx>, job: &mut Job, reason: &str) -> Result<()> {
        let exp = 2u32.saturating_pow(job.retry_count.min(16));
        let delay = (BACKOFF_BASE * exp).min(BACKOFF_CAP);
        let next_retry = job.retry_count + 1;

        log::warn!(
            "job {} retry {}/{} in {:?}: {reason}",
            job.id,
            next_retry,
            job.max_retries,
            delay
        );

        let until = Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);
        let committed = Self::commit(ctx, job, |j| {
            j.status = JobStatus::Queued;
            j.retry_count = next_retry;
            j.backoff_until = Some(until);
            j.error_message = Some(reason.to_string());
            j.instance_id = None;
            j.assigned_at = None;
            j.started_at = None;
            j.estimated_completion_at = None;
        })?;
        if committed {
            // New queue entry; wake the scheduler once the backoff allows.
            ctx.submit_signal.notify_one();
        }
        Ok(())
    }

    fn terminalise(
        ctx: &Arc<OrchCtx>,
        job: &mut Job,
        status: JobStatus,
        error: Option<String>,
        output: Option<Value>,
        actual_cost: f64,
    ) -> Result<()> {
        let committed = Self::commit(ctx, job, |j| {
            j.status = status;
            j.completed_at = Some(Utc::now());
            j.actual_cost_usd = Some(actual_cost);
            j.error_message = error.clone();
            if let Some(out) = &output {
                j.output = Some(out.clone());
                j.progress_percent = 100.0;
            }
        })?;
        if committed {
            log::info!(
                "job {} terminal: {} (cost ${:.4})",
                job.id,
                status,
                actual_cost
            );
        }
        Ok(())
    }

    /// Guarded write with bounded reject-and-retry. Returns false when the
    /// row reached a terminal status under us; the caller abandons.
    pub(crate) fn commit<F: Fn(&mut Job)>(
        ctx: &Arc<OrchCtx>,
        job: &mut Job,
        mutate: F,
    ) -> Result<bool> {
        for _ in 0..WRITE_ATTEMPTS {
            mutate(job);
            if ctx.store.update_job_guarded(job)? {
                return Ok(true);
            }
            match ctx.store.get_job(job.id)? {
                Some(fresh) if fresh.status.is_terminal() => {
                    *job = fresh;
                    return Ok(false);
                }
                Some(fresh) => *job = fresh,
                None => {
                    return Err(OrchestratorError::Internal(format!(
                        "job {} vanished mid-write",
                        job.id
                    )))
                }
            }
        }
        Err(OrchestratorError::Database(format!(
            "job {}: persistent version conflict",
            job.id
        )))
    }

    // -------------------------------------------------------------------------
    // Instance teardown
    // -------------------------------------------------------------------------

    /// Request termination, give the monitor a bounded window to observe
    /// it, then force-settle locally so no instance outlives its job.
    /// Returns the settled cost of the rental.
    pub(crate) async fn teardown_instance(
        ctx: &Arc<OrchCtx>,
        adapter: &dyn GpuProvider,
        instance_id: Uuid,
    ) -> f64 {
        let Ok(Some(mut instance)) = ctx.store.get_instance(instance_id) else {
            return 0.0;
        };
        if instance.status.is_terminal() {
            return instance.settled_cost();
        }

        if let Err(e) = adapter.terminate_instance(&instance).await {
            log::error!("teardown: terminate {} failed: {e}", instance.id);
        }

        // Let the monitor record the provider-observed final state.
        let poll = Duration::from_millis(500);
        let mut waited = Duration::ZERO;
        while waited < TEARDOWN_SETTLE {
            sleep(poll).await;
            waited += poll;
            match ctx.store.get_instance(instance_id) {
                Ok(Some(i)) if i.status.is_terminal() => return i.settled_cost(),
                Ok(Some(i)) => instance = i,
                _ => break,
            }
        }

        // Monitor never confirmed; settle the books ourselves.
        force_settle(&mut instance);
        if let Err(e) = ctx.store.update_instance(&instance) {
            log::error!("teardown: persist {} failed: {e}", instance.id);
        }
        instance.settled_cost()
    }
}

pub(crate) fn force_settle(instance: &mut Instance) {
    instance.status = InstanceStatus::Terminated;
    if instance.stopped_at.is_none() {
        instance.stopped_at = Some(Utc::now());
    }
    instance.total_cost_usd = instance.settled_cost().max(instance.total_cost_usd);
}

// -----------------------------------------------------------------------------
// Await helpers
// -----------------------------------------------------------------------------

/// Resolve once the watch value satisfies the predicate; None if the
/// sender is gone.
async fn wait_for_status<F>(
    rx: &mut watch::Receiver<InstanceStatus>,
    pred: F,
) -> Option<InstanceStatus>
where
    F: Fn(InstanceStatus) -> bool,
{
    loop {
        let current = *rx.borrow();
        if pred(current) {
            return Some(current);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

/// Resolve when cancellation is signalled; never resolves otherwise.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without a cancel: park forever.
            std::future::pending::<()>().await;
        }
    }
}

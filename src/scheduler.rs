// src/scheduler.rs
//
// =============================================================================
// GPUFLOW: SCHEDULER & CLEANUP LOOPS
// =============================================================================
//
// The Scheduler Loop: one cooperative task that wakes every tick (or on a
// new-job signal), loads the queue in effective-priority order, applies
// aging, and hands candidates to Job Runner tasks. Hand-off is
// non-blocking; the global concurrency cap is a semaphore whose permits
// live exactly as long as the runner tasks.
//
// Fairness: one user receives at most `fairness_window` consecutive
// dispatches before the loop moves on; skipped jobs get a second pass in
// the same tick once other users had their turn.
//
// The Cleanup Loop: a slower sweep that terminates orphan instances,
// terminalises abandoned or overdue jobs, fails stale queue entries, and
// compacts history.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::{Job, JobStatus};
use crate::error::Result;
use crate::orchestrator::OrchCtx;
use crate::runner::{force_settle, JobRunner};

pub struct Scheduler;

impl Scheduler {
    pub async fn run(ctx: Arc<OrchCtx>) {
        let mut shutdown = ctx.shutdown.subscribe();
        log::info!(
            "scheduler active: cap={} tick={:?}",
            ctx.settings.max_concurrent_jobs,
            ctx.settings.scheduler_interval
        );

        loop {
            if let Err(e) = Self::tick(&ctx) {
                log::error!("scheduler tick failed: {e}");
            }

            tokio::select! {
                _ = sleep(ctx.settings.scheduler_interval) => {}
                _ = ctx.submit_signal.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One queue drain. Purely synchronous: all provider work happens in
    /// the spawned runner tasks.
    fn tick(ctx: &Arc<OrchCtx>) -> Result<()> {
        let now = Utc::now();
        let mut queued = ctx.store.load_queued(now)?;
        if queued.is_empty() {
            return Ok(());
        }

        let window = ctx.settings.priority_boost_window;
        queued.sort_by(|a, b| {
            effective_priority(a, now, window)
                .cmp(&effective_priority(b, now, window))
                .then(a.created_at.cmp(&b.created_at))
        });

        let fairness = ctx.settings.fairness_window.max(1);
        let mut pending: VecDeque<Job> = queued.into();
        let mut deferred: Vec<Job> = Vec::new();
        let mut last_user = None;
        let mut consecutive = 0u32;

        while let Some(job) = pending.pop_front() {
            if ctx.active_runners.lock().unwrap().contains_key(&job.id) {
                continue;
            }
            if last_user == Some(job.user_id) && consecutive >= fairness {
                deferred.push(job);
                continue;
            }
            if !Self::dispatch(ctx, &job) {
                return Ok(()); // cap reached
            }
            if last_user == Some(job.user_id) {
                consecutive += 1;
            } else {
                last_user = Some(job.user_id);
                consecutive = 1;
            }
        }

        // Second pass: jobs skipped for fairness run once everyone else
        // had a chance, capacity permitting.
        for job in deferred {
            if ctx.active_runners.lock().unwrap().contains_key(&job.id) {
                continue;
            }
            if !Self::dispatch(ctx, &job) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Non-blocking hand-off. False when no dispatch slot is free.
    fn dispatch(ctx: &Arc<OrchCtx>, job: &Job) -> bool {
        let Ok(permit) = ctx.dispatch_slots.clone().try_acquire_owned() else {
            return false;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        ctx.active_runners
            .lock()
            .unwrap()
            .insert(job.id, cancel_tx);

        log::debug!("dispatching job {} (prio {})", job.id, job.priority);
        let ctx = ctx.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let _permit = permit;
            JobRunner::run(ctx, job_id, cancel_rx).await;
        });
        true
    }
}

/// Stored priority minus one per full aging window waited, floored at 1.
pub fn effective_priority(job: &Job, now: DateTime<Utc>, window: std::time::Duration) -> u8 {
    let window_secs = window.as_secs();
    if window_secs == 0 {
        return job.priority;
    }
    let waited = (now - job.created_at).num_seconds().max(0) as u64;
    let crossings = (waited / window_secs) as i64;
    (job.priority as i64 - crossings).max(1) as u8
}

// =============================================================================
// CLEANUP
// =============================================================================

pub struct Cleanup;

impl Cleanup {
    pub async fn run(ctx: Arc<OrchCtx>) {
        let mut shutdown = ctx.shutdown.subscribe();
        log::info!("cleanup sweeper active ({:?})", ctx.settings.cleanup_interval);

        loop {
            tokio::select! {
                _ = sleep(ctx.settings.cleanup_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if let Err(e) = Self::sweep(&ctx).await {
                log::error!("cleanup sweep failed: {e}");
            }
        }
    }

    pub async fn sweep(ctx: &Arc<OrchCtx>) -> Result<()> {
        let now = Utc::now();

        // 1. Orphan instances: live rentals no active job owns.
        for instance in ctx.store.find_orphan_instances()? {
            log::warn!(
                "cleanup: orphan instance {} on {}, terminating",
                instance.id,
                instance.provider
            );
            if let Some(adapter) = ctx.registry.adapter(instance.provider) {
                if let Err(e) = adapter.terminate_instance(&instance).await {
                    log::error!("cleanup: terminate {} failed: {e}", instance.id);
                }
            }
            let mut settled = instance;
            force_settle(&mut settled);
            ctx.store.update_instance(&settled)?;
        }

        // 2. Abandoned in-flight jobs: non-terminal, no runner task owns
        //    them (e.g. after a crash-restart) and their window has passed.
        for mut job in ctx.store.load_in_flight()? {
            if ctx.active_runners.lock().unwrap().contains_key(&job.id) {
                continue;
            }
            let overdue = match (job.started_at, job.assigned_at) {
                (Some(started), _) => {
                    now > started
                        + ChronoDuration::seconds(job.run_deadline_secs() as i64)
                        + ChronoDuration::seconds(60)
                }
                (None, Some(assigned)) => {
                    now > assigned
                        + ChronoDuration::seconds(ctx.settings.readiness_timeout.as_secs() as i64)
                        + ChronoDuration::seconds(60)
                }
                (None, None) => true,
            };
            if !overdue {
                continue;
            }

            log::warn!("cleanup: job {} abandoned in {}, timing out", job.id, job.status);

            // Free the rental first so the settled cost lands in the same
            // write as the terminal status.
            let mut cost = 0.0;
            if let Some(id) = job.instance_id {
                if let Ok(Some(instance)) = ctx.store.get_instance(id) {
                    if let Some(adapter) = ctx.registry.adapter(instance.provider) {
                        cost = JobRunner::teardown_instance(ctx, adapter.as_ref(), id).await;
                    }
                }
            }
            JobRunner::commit(ctx, &mut job, |j| {
                j.status = JobStatus::Timeout;
                j.completed_at = Some(Utc::now());
                j.actual_cost_usd = Some(cost);
                j.error_message = Some("orchestrator lost track of this job".to_string());
            })?;
        }

        // 3. Stale queue entries past the global job timeout.
        let stale_cutoff = now - ChronoDuration::hours(ctx.settings.job_timeout_hours as i64);
        for mut job in ctx.store.load_queued_before(stale_cutoff)? {
            if ctx.active_runners.lock().unwrap().contains_key(&job.id) {
                continue;
            }
            log::warn!("cleanup: job {} queued too long, failing", job.id);
            JobRunner::commit(ctx, &mut job, |j| {
                j.status = JobStatus::Failed;
                j.completed_at = Some(Utc::now());
                j.actual_cost_usd = Some(0.0);
                j.error_message =
                    Some("TIMEOUT: job waited in queue past the global timeout".to_string());
            })?;
        }

        // 4. Compaction: bounded audit history, bounded instance archive.
        ctx.store.compact_config_history(50)?;
        let purged = ctx
            .store
            .delete_instances_stopped_before(now - ChronoDuration::days(30))?;
        if purged > 0 {
            log::info!("cleanup: purged {purged} archived instance rows");
        }

        Ok(())
    }
}

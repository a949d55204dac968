// tests/common/mod.rs
//
// Shared harness for the integration suite: a full orchestrator wired to
// the in-process simulated provider and workload, against a scratch
// database. Timing-sensitive tests run under tokio's paused clock, so the
// spec-level intervals (30 s polls, 60 s backoff, 10 min readiness) cost
// no wall time.

#![allow(dead_code)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use gpuflow::config::Settings;
use gpuflow::core::{
    GpuType, Job, JobStatus, JobType, Principal, ProviderKind, ProviderSettings, SubmitRequest,
};
use gpuflow::orchestrator::Orchestrator;
use gpuflow::providers::local::LocalProvider;
use gpuflow::providers::ProviderRegistry;
use gpuflow::store::JobStore;
use gpuflow::workload::LocalWorkloadExecutor;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<JobStore>,
    pub provider: Arc<LocalProvider>,
    pub workload: Arc<LocalWorkloadExecutor>,
    pub user: Principal,
    _dir: TempDir,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut Settings)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.database_path = dir.path().join("gpuflow.db");
    // Short tick + poll keep the virtual-clock tests snappy; every other
    // knob stays at its production value.
    settings.scheduler_interval = Duration::from_millis(100);
    settings.instance_poll_interval = Duration::from_millis(50);
    settings.cleanup_interval = Duration::from_secs(3600);
    tweak(&mut settings);

    let store = Arc::new(JobStore::open(&settings.database_path).expect("open store"));
    let provider = Arc::new(LocalProvider::new());
    let workload = Arc::new(LocalWorkloadExecutor::new());

    let mut registry = ProviderRegistry::new();
    registry.register(
        provider.clone(),
        ProviderSettings::defaults(ProviderKind::Local, "local://".to_string()),
    );

    let orchestrator = Orchestrator::with_parts(
        settings,
        store.clone(),
        registry,
        workload.clone(),
    )
    .expect("orchestrator");

    Harness {
        orchestrator,
        store,
        provider,
        workload,
        user: Principal {
            user_id: Uuid::new_v4(),
        },
        _dir: dir,
    }
}

/// Poll (in virtual time) until the job satisfies the predicate.
pub async fn wait_for_job(
    h: &Harness,
    user: Principal,
    job_id: Uuid,
    what: &str,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3600);
    loop {
        let job = h
            .orchestrator
            .get_job(user, job_id)
            .expect("get_job")
            .expect("job exists");
        if pred(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}; job is {} (error: {:?})",
            job.status,
            job.error_message
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

pub async fn wait_for_terminal(h: &Harness, user: Principal, job_id: Uuid) -> Job {
    wait_for_job(h, user, job_id, "terminal status", |j| j.status.is_terminal()).await
}

/// A plain inference request: 1x RTX4090 for `runtime_min` minutes.
pub fn small_request(runtime_min: u32) -> SubmitRequest {
    SubmitRequest {
        job_type: Some(JobType::Batch),
        model_name: Some("test-model".to_string()),
        input: json!({"prompt": "hello"}),
        priority: Some(5),
        gpu_type: Some(GpuType::Rtx4090),
        gpu_count: Some(1),
        memory_gb: Some(24),
        max_runtime_minutes: Some(runtime_min),
        max_retries: None,
    }
}

/// Fabricate a job row directly (for store-level and scheduler-ordering
/// tests that need controlled timestamps).
pub fn make_job(user_id: Uuid, priority: u8, created_at: DateTime<Utc>) -> Job {
    Job {
        id: Uuid::new_v4(),
        user_id,
        job_type: JobType::Batch,
        model_name: "fabricated".to_string(),
        template_name: None,
        priority,
        gpu_type: GpuType::Rtx4090,
        gpu_count: 1,
        memory_gb: 24,
        max_runtime_minutes: 60,
        input: json!({}),
        output: None,
        error_message: None,
        status: JobStatus::Queued,
        progress_percent: 0.0,
        created_at,
        updated_at: created_at,
        assigned_at: None,
        started_at: None,
        completed_at: None,
        estimated_completion_at: None,
        estimated_cost_usd: 0.5,
        actual_cost_usd: None,
        retry_count: 0,
        max_retries: 3,
        backoff_until: None,
        instance_id: None,
        version: 0,
    }
}

pub fn hours_ago(h: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::hours(h)
}

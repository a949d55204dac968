// tests/admission_tests.rs
//
// Admission control: quota ceilings, validation, template expansion laws,
// priority boost, and the backpressure gate.

mod common;

use chrono::Utc;
use common::{harness, make_job, small_request};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use gpuflow::core::{GpuType, JobStatus, JobType, ProviderKind, ResourceQuota, SubmitRequest};
use gpuflow::error::OrchestratorError;
use gpuflow::orchestrator::TemplateSpec;

#[tokio::test]
async fn submit_requires_job_type_and_model() {
    let h = harness();

    let mut req = small_request(60);
    req.job_type = None;
    let err = h.orchestrator.submit_job(h.user, req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let mut req = small_request(60);
    req.model_name = None;
    let err = h.orchestrator.submit_job(h.user, req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let mut req = small_request(60);
    req.priority = Some(11);
    let err = h.orchestrator.submit_job(h.user, req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[tokio::test]
async fn concurrent_job_quota_rejects_at_the_limit() {
    let h = harness();

    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.max_concurrent_jobs = 1;
    h.store.upsert_quota(&quota).unwrap();

    // One job already holding capacity.
    let mut running = make_job(h.user.user_id, 5, Utc::now());
    h.store.insert_job(&running).unwrap();
    running.status = JobStatus::Running;
    assert!(h.store.update_job_guarded(&mut running).unwrap());

    let err = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap_err();
    assert!(
        matches!(err, OrchestratorError::QuotaExceeded(_)),
        "expected QUOTA_EXCEEDED, got {err}"
    );
}

#[tokio::test]
async fn gpu_hours_ceiling_counts_the_projection() {
    let h = harness();

    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.max_gpu_hours_per_day = 1.0;
    h.store.upsert_quota(&quota).unwrap();

    // 2 GPUs x 2 hours projected = 4 GPU-hours > 1.
    let mut req = small_request(120);
    req.gpu_count = Some(2);
    let err = h.orchestrator.submit_job(h.user, req).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));

    // 30 minutes on one GPU fits.
    let ok = h.orchestrator.submit_job(h.user, small_request(30)).await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn daily_cost_ceiling_uses_the_estimate() {
    let h = harness();
    h.provider.set_price(GpuType::Rtx4090, 100.0);

    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.max_cost_per_day_usd = 10.0;
    h.store.upsert_quota(&quota).unwrap();

    // $100/h for an hour blows the $10/day budget.
    let err = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));
}

#[tokio::test]
async fn disallowed_gpu_type_is_rejected() {
    let h = harness();

    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.allowed_gpu_types = vec![GpuType::T4];
    h.store.upsert_quota(&quota).unwrap();

    let err = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));

    let mut req = small_request(60);
    req.gpu_type = Some(GpuType::T4);
    assert!(h.orchestrator.submit_job(h.user, req).await.is_ok());
}

#[tokio::test]
async fn disallowed_provider_set_blocks_admission() {
    let h = harness();

    // Only RunPod allowed, but only the local simulator is registered.
    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.allowed_providers = vec![ProviderKind::RunPod];
    h.store.upsert_quota(&quota).unwrap();

    let err = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));
}

#[tokio::test]
async fn priority_boost_is_applied_and_clamped() {
    let h = harness();

    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.priority_boost = 2;
    h.store.upsert_quota(&quota).unwrap();

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();
    let job = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();
    assert_eq!(job.priority, 3, "5 - boost 2 = 3");

    let mut quota = ResourceQuota::default_for(h.user.user_id);
    quota.priority_boost = 100;
    h.store.upsert_quota(&quota).unwrap();
    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap();
    let job = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();
    assert_eq!(job.priority, 1, "boost clamps at the top priority");
}

#[tokio::test]
async fn job_type_defaults_fill_missing_resources() {
    let h = harness();

    let req = SubmitRequest {
        job_type: Some(JobType::LlamaInference),
        model_name: Some("llama-3.1-70b".to_string()),
        input: json!({}),
        ..Default::default()
    };
    let ticket = h.orchestrator.submit_job(h.user, req).await.unwrap();
    let job = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();

    assert_eq!(job.gpu_type, GpuType::Rtx4090);
    assert_eq!(job.gpu_count, 2);
    assert_eq!(job.memory_gb, 48);
    assert_eq!(job.max_runtime_minutes, 60);
    assert!(job.estimated_cost_usd > 0.0);
}

#[tokio::test]
async fn estimate_uses_cheapest_capable_provider() {
    let h = harness();
    h.provider.set_price(GpuType::Rtx4090, 2.0);

    let ticket = h
        .orchestrator
        .submit_job(h.user, small_request(30))
        .await
        .unwrap();
    // $2/h x 1 GPU x 0.5h.
    assert!((ticket.estimated_cost_usd - 1.0).abs() < 1e-9);
}

// -----------------------------------------------------------------------------
// Templates
// -----------------------------------------------------------------------------

fn llama_template() -> TemplateSpec {
    TemplateSpec {
        name: "llama-70b".to_string(),
        description: Some("standard llama serving".to_string()),
        job_type: JobType::LlamaInference,
        model_name: "llama-3.1-70b".to_string(),
        docker_image: Some("runpod/llama:3.1-70b".to_string()),
        gpu_type: GpuType::A100,
        gpu_count: 2,
        memory_gb: 160,
        max_runtime_minutes: 90,
        default_env: HashMap::from([("HF_HOME".to_string(), "/workspace/hf".to_string())]),
    }
}

#[tokio::test]
async fn unknown_template_is_a_404_class_error() {
    let h = harness();
    let err = h
        .orchestrator
        .submit_from_template(h.user, "no-such-template", SubmitRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::TemplateNotFound(_)));
}

#[tokio::test]
async fn template_fills_every_missing_field() {
    let h = harness();
    h.orchestrator.create_template(h.user, llama_template()).unwrap();

    let ticket = h
        .orchestrator
        .submit_from_template(
            h.user,
            "llama-70b",
            SubmitRequest {
                input: json!({"prompt": "hi"}),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();
    assert_eq!(job.job_type, JobType::LlamaInference);
    assert_eq!(job.model_name, "llama-3.1-70b");
    assert_eq!(job.gpu_type, GpuType::A100);
    assert_eq!(job.gpu_count, 2);
    assert_eq!(job.memory_gb, 160);
    assert_eq!(job.max_runtime_minutes, 90);
    assert_eq!(job.template_name.as_deref(), Some("llama-70b"));
    // The template's default env landed in the input bag.
    assert_eq!(
        job.input["environment"]["HF_HOME"],
        json!("/workspace/hf")
    );
}

#[tokio::test]
async fn explicit_overrides_beat_template_fields() {
    let h = harness();
    h.orchestrator.create_template(h.user, llama_template()).unwrap();

    let overrides = SubmitRequest {
        job_type: None,
        model_name: Some("llama-3.1-8b".to_string()),
        input: json!({"environment": {"HF_HOME": "/custom"}}),
        priority: Some(2),
        gpu_type: Some(GpuType::Rtx4090),
        gpu_count: Some(1),
        memory_gb: Some(24),
        max_runtime_minutes: Some(15),
        max_retries: Some(0),
    };
    let ticket = h
        .orchestrator
        .submit_from_template(h.user, "llama-70b", overrides)
        .await
        .unwrap();

    let job = h.orchestrator.get_job(h.user, ticket.job_id).unwrap().unwrap();
    // Every overridden field wins; the untouched one (job_type) comes from
    // the template.
    assert_eq!(job.job_type, JobType::LlamaInference);
    assert_eq!(job.model_name, "llama-3.1-8b");
    assert_eq!(job.priority, 2);
    assert_eq!(job.gpu_type, GpuType::Rtx4090);
    assert_eq!(job.gpu_count, 1);
    assert_eq!(job.memory_gb, 24);
    assert_eq!(job.max_runtime_minutes, 15);
    assert_eq!(job.max_retries, 0);
    assert_eq!(job.input["environment"]["HF_HOME"], json!("/custom"));
}

#[tokio::test]
async fn template_usage_is_tracked() {
    let h = harness();
    h.orchestrator.create_template(h.user, llama_template()).unwrap();

    for _ in 0..2 {
        h.orchestrator
            .submit_from_template(
                h.user,
                "llama-70b",
                SubmitRequest {
                    max_runtime_minutes: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let templates = h.orchestrator.list_templates().unwrap();
    let t = templates.iter().find(|t| t.name == "llama-70b").unwrap();
    assert_eq!(t.usage_count, 2);
    assert!(t.last_used_at.is_some());
}

// -----------------------------------------------------------------------------
// Backpressure
// -----------------------------------------------------------------------------

#[tokio::test]
async fn queue_gate_closes_and_reopens_with_hysteresis() {
    let h = harness();

    // A separate user per job sidesteps the per-user concurrency quota.
    for _ in 0..1000 {
        let job = make_job(Uuid::new_v4(), 5, Utc::now());
        h.store.insert_job(&job).unwrap();
    }

    let err = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QueueFull { .. }));

    // Drain to 900: still above the resume mark, gate stays closed.
    cancel_queued(&h, 100);
    let err = h
        .orchestrator
        .submit_job(h.user, small_request(60))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QueueFull { .. }));

    // Drain below 800: gate reopens.
    cancel_queued(&h, 150);
    assert!(h.orchestrator.submit_job(h.user, small_request(60)).await.is_ok());
}

fn cancel_queued(h: &common::Harness, n: usize) {
    let now = Utc::now();
    let mut cancelled = 0;
    for job in h.store.load_queued(now).unwrap() {
        if cancelled >= n {
            break;
        }
        let mut live = h.store.get_job(job.id).unwrap().unwrap();
        live.status = JobStatus::Cancelled;
        live.completed_at = Some(now);
        if h.store.update_job_guarded(&mut live).unwrap() {
            cancelled += 1;
        }
    }
    assert_eq!(cancelled, n);
}

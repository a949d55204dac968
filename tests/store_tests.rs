// tests/store_tests.rs
//
// Persistence-layer behaviour: round-trips, the optimistic version guard,
// terminal immutability, instance uniqueness, and the config audit trail.

mod common;

use chrono::Utc;
use common::{hours_ago, make_job};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use gpuflow::core::{
    GpuType, Instance, InstanceStatus, JobStatus, JobTemplate, ProviderKind, ProviderSettings,
    ResourceQuota,
};
use gpuflow::store::JobStore;

fn scratch_store() -> (JobStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = JobStore::open(dir.path().join("test.db")).unwrap();
    (store, dir)
}

fn make_instance(provider: ProviderKind, pid: &str) -> Instance {
    Instance {
        id: Uuid::new_v4(),
        provider,
        provider_instance_id: pid.to_string(),
        gpu_type: GpuType::A100,
        gpu_count: 2,
        memory_gb: 160,
        vcpus: 32,
        storage_gb: 50,
        status: InstanceStatus::Pending,
        public_ip: None,
        private_ip: None,
        ssh_port: None,
        api_port: Some(8000),
        hourly_cost_usd: 2.5,
        total_cost_usd: 0.0,
        docker_image: None,
        env: HashMap::new(),
        startup_script: None,
        region: None,
        preemptible: true,
        auto_terminate_minutes: None,
        provider_metadata: json!({}),
        created_at: Utc::now(),
        started_at: None,
        stopped_at: None,
        last_heartbeat: None,
    }
}

#[test]
fn job_round_trip() {
    let (store, _dir) = scratch_store();
    let job = make_job(Uuid::new_v4(), 5, Utc::now());
    store.insert_job(&job).unwrap();

    let loaded = store.get_job(job.id).unwrap().expect("job present");
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.user_id, job.user_id);
    assert_eq!(loaded.status, JobStatus::Queued);
    assert_eq!(loaded.priority, 5);
    assert_eq!(loaded.gpu_type, GpuType::Rtx4090);
    assert_eq!(loaded.version, 0);
}

#[test]
fn guarded_write_detects_stale_version() {
    let (store, _dir) = scratch_store();
    let job = make_job(Uuid::new_v4(), 5, Utc::now());
    store.insert_job(&job).unwrap();

    let mut copy_a = store.get_job(job.id).unwrap().unwrap();
    let mut copy_b = store.get_job(job.id).unwrap().unwrap();

    copy_a.status = JobStatus::Assigned;
    assert!(store.update_job_guarded(&mut copy_a).unwrap());
    assert_eq!(copy_a.version, 1);

    // The second writer holds version 0 and must be rejected.
    copy_b.status = JobStatus::Cancelled;
    assert!(!store.update_job_guarded(&mut copy_b).unwrap());

    let current = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Assigned);
}

#[test]
fn terminal_rows_are_immutable() {
    let (store, _dir) = scratch_store();
    let job = make_job(Uuid::new_v4(), 5, Utc::now());
    store.insert_job(&job).unwrap();

    let mut live = store.get_job(job.id).unwrap().unwrap();
    live.status = JobStatus::Completed;
    live.completed_at = Some(Utc::now());
    live.actual_cost_usd = Some(1.25);
    assert!(store.update_job_guarded(&mut live).unwrap());

    // Even with the correct version, a terminal row refuses further writes.
    let mut again = store.get_job(job.id).unwrap().unwrap();
    again.status = JobStatus::Failed;
    assert!(!store.update_job_guarded(&mut again).unwrap());

    let current = store.get_job(job.id).unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Completed);
    assert_eq!(current.actual_cost_usd, Some(1.25));
}

#[test]
fn provider_instance_id_is_unique_per_provider() {
    let (store, _dir) = scratch_store();

    store
        .insert_instance(&make_instance(ProviderKind::RunPod, "pod-1"))
        .unwrap();
    // Same id on another provider is fine.
    store
        .insert_instance(&make_instance(ProviderKind::Vast, "pod-1"))
        .unwrap();
    // Same (provider, id) pair is not.
    let dup = store.insert_instance(&make_instance(ProviderKind::RunPod, "pod-1"));
    assert!(dup.is_err(), "duplicate (provider, id) must be rejected");
}

#[test]
fn orphan_detection_skips_owned_instances() {
    let (store, _dir) = scratch_store();

    let owned = make_instance(ProviderKind::Local, "i-owned");
    let orphan = make_instance(ProviderKind::Local, "i-orphan");
    store.insert_instance(&owned).unwrap();
    store.insert_instance(&orphan).unwrap();

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    store.insert_job(&job).unwrap();
    let mut live = store.get_job(job.id).unwrap().unwrap();
    live.status = JobStatus::Assigned;
    live.instance_id = Some(owned.id);
    assert!(store.update_job_guarded(&mut live).unwrap());
    job = live;

    let orphans = store.find_orphan_instances().unwrap();
    let ids: Vec<Uuid> = orphans.iter().map(|i| i.id).collect();
    assert!(ids.contains(&orphan.id));
    assert!(!ids.contains(&job.instance_id.unwrap()));
}

#[test]
fn queued_jobs_respect_backoff_window() {
    let (store, _dir) = scratch_store();
    let now = Utc::now();

    let ready = make_job(Uuid::new_v4(), 5, now);
    let mut backing_off = make_job(Uuid::new_v4(), 5, now);
    backing_off.backoff_until = Some(now + chrono::Duration::minutes(5));
    store.insert_job(&ready).unwrap();
    store.insert_job(&backing_off).unwrap();

    let ids: Vec<Uuid> = store.load_queued(now).unwrap().iter().map(|j| j.id).collect();
    assert!(ids.contains(&ready.id));
    assert!(!ids.contains(&backing_off.id));

    // Once the backoff elapses it reappears.
    let later = now + chrono::Duration::minutes(6);
    let ids: Vec<Uuid> = store.load_queued(later).unwrap().iter().map(|j| j.id).collect();
    assert!(ids.contains(&backing_off.id));
}

#[test]
fn daily_usage_counts_completed_gpu_hours_and_all_costs() {
    let (store, _dir) = scratch_store();
    let user = Uuid::new_v4();
    let now = Utc::now();

    // Completed: 2 GPUs for 2 hours => 4 GPU-hours, $5 spent.
    let mut done = make_job(user, 5, hours_ago(3));
    store.insert_job(&done).unwrap();
    let mut live = store.get_job(done.id).unwrap().unwrap();
    live.status = JobStatus::Completed;
    live.gpu_count = 2;
    live.started_at = Some(hours_ago(3));
    live.completed_at = Some(hours_ago(1));
    live.actual_cost_usd = Some(5.0);
    assert!(store.update_job_guarded(&mut live).unwrap());
    done = live;

    // Failed job: no GPU-hours, but its cost still counts.
    let failed = make_job(user, 5, hours_ago(2));
    store.insert_job(&failed).unwrap();
    let mut live = store.get_job(failed.id).unwrap().unwrap();
    live.status = JobStatus::Failed;
    live.completed_at = Some(now);
    live.actual_cost_usd = Some(1.0);
    assert!(store.update_job_guarded(&mut live).unwrap());

    let (gpu_hours, cost) = store.daily_usage(user, hours_ago(24)).unwrap();
    assert!(
        (gpu_hours - 4.0).abs() < 0.01,
        "expected ~4 GPU-hours, got {gpu_hours}"
    );
    assert!((cost - 6.0).abs() < 0.01, "expected ~$6, got {cost}");
    let _ = done;
}

#[test]
fn template_names_are_unique() {
    let (store, _dir) = scratch_store();
    let now = Utc::now();
    let template = JobTemplate {
        id: Uuid::new_v4(),
        name: "llama-70b".to_string(),
        description: None,
        job_type: gpuflow::core::JobType::LlamaInference,
        model_name: "llama-3.1-70b".to_string(),
        docker_image: None,
        gpu_type: GpuType::A100,
        gpu_count: 2,
        memory_gb: 160,
        max_runtime_minutes: 60,
        default_env: HashMap::new(),
        created_by: Uuid::new_v4(),
        created_at: now,
        updated_at: now,
        usage_count: 0,
        last_used_at: None,
    };
    store.insert_template(&template).unwrap();

    let mut dup = template.clone();
    dup.id = Uuid::new_v4();
    assert!(store.insert_template(&dup).is_err());
}

#[test]
fn quota_round_trip() {
    let (store, _dir) = scratch_store();
    let user = Uuid::new_v4();
    assert!(store.get_quota(user).unwrap().is_none());

    let mut quota = ResourceQuota::default_for(user);
    quota.max_concurrent_jobs = 1;
    quota.priority_boost = 2;
    store.upsert_quota(&quota).unwrap();

    let loaded = store.get_quota(user).unwrap().unwrap();
    assert_eq!(loaded.max_concurrent_jobs, 1);
    assert_eq!(loaded.priority_boost, 2);
}

#[test]
fn provider_settings_changes_are_audited() {
    let (store, _dir) = scratch_store();

    let mut settings = ProviderSettings::defaults(ProviderKind::RunPod, "https://api".into());
    store.upsert_provider_settings(&settings).unwrap();

    settings.max_hourly_cost_usd = 25.0;
    store.upsert_provider_settings(&settings).unwrap();
    // Identical write: no new history row.
    store.upsert_provider_settings(&settings).unwrap();

    let history = store.config_history("provider/runpod", 10).unwrap();
    assert_eq!(history.len(), 2, "initial insert + one change");
    assert!(history[0].old_value.is_some());
    assert!(history[1].old_value.is_none());
}

// src/orchestrator.rs
//
// =============================================================================
// GPUFLOW: ORCHESTRATOR CONTEXT & PUBLIC OPERATIONS
// =============================================================================
//
// The wiring center. `OrchCtx` is the explicit dependency bundle built
// once at startup and handed to every long-lived task; there are no
// global singletons. `Orchestrator` is the facade the outer transport
// (HTTP, CLI) calls, one method per public operation, each taking the
// authenticated `Principal`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, Semaphore};
use uuid::Uuid;

use crate::admission::AdmissionControl;
use crate::config::Settings;
use crate::core::{
    GpuOffering, GpuType, Instance, Job, JobStatus, JobTemplate, JobTicket, JobType, Principal,
    ProviderHealth, ProviderKind, ProviderSettings, QueueStatus, QuotaStatus, SubmitRequest,
};
use crate::error::{OrchestratorError, Result};
use crate::placement::PlacementPlanner;
use crate::providers::local::LocalProvider;
use crate::providers::runpod::RunPodProvider;
use crate::providers::vast::VastProvider;
use crate::providers::ProviderRegistry;
use crate::runner::JobRunner;
use crate::scheduler::{Cleanup, Scheduler};
use crate::store::JobStore;
use crate::workload::{HttpWorkloadExecutor, LocalWorkloadExecutor, WorkloadExecutor};

// ============================================================================
// 1. THE CONTEXT OBJECT
// ============================================================================

pub struct OrchCtx {
    pub settings: Settings,
    pub store: Arc<JobStore>,
    pub registry: Arc<ProviderRegistry>,
    pub planner: PlacementPlanner,
    pub workload: Arc<dyn WorkloadExecutor>,
    pub admission: AdmissionControl,

    /// Wakes the scheduler ahead of its tick on fresh submissions.
    pub submit_signal: Notify,
    /// Global concurrency cap; a permit lives as long as its runner task.
    pub dispatch_slots: Arc<Semaphore>,
    /// Cancel channels for every live runner, keyed by job id.
    pub active_runners: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    /// Broadcast to all long-lived tasks on shutdown.
    pub shutdown: watch::Sender<bool>,
}

// ============================================================================
// 2. THE ORCHESTRATOR
// ============================================================================

#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<OrchCtx>,
}

/// Request model for `create_template`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    pub model_name: String,
    pub docker_image: Option<String>,
    pub gpu_type: GpuType,
    pub gpu_count: u32,
    pub memory_gb: u32,
    pub max_runtime_minutes: u32,
    #[serde(default)]
    pub default_env: HashMap<String, String>,
}

impl Orchestrator {
    /// Assemble from parts. Tests use this to hand in scripted adapters
    /// and workloads; production goes through `bootstrap`.
    pub fn with_parts(
        settings: Settings,
        store: Arc<JobStore>,
        registry: ProviderRegistry,
        workload: Arc<dyn WorkloadExecutor>,
    ) -> Result<Self> {
        for entry in registry.all() {
            store.upsert_provider_settings(&entry.settings)?;
        }

        let registry = Arc::new(registry);
        let admission = AdmissionControl::new(store.clone(), registry.clone(), settings.clone());
        let planner = PlacementPlanner::new(settings.strategy(), settings.max_hourly_cost_usd);
        let (shutdown, _) = watch::channel(false);

        let ctx = Arc::new(OrchCtx {
            dispatch_slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs)),
            settings,
            store,
            registry,
            planner,
            workload,
            admission,
            submit_signal: Notify::new(),
            active_runners: Mutex::new(HashMap::new()),
            shutdown,
        });
        Ok(Self { ctx })
    }

    /// Production wiring: adapters for every provider with credentials,
    /// or the in-process simulator when `local_only` is set.
    pub fn bootstrap(settings: Settings, local_only: bool) -> Result<Self> {
        let store = Arc::new(JobStore::open(&settings.database_path)?);
        let mut registry = ProviderRegistry::new();

        let persisted = |store: &JobStore, kind: ProviderKind, endpoint: &str| {
            store
                .get_provider_settings(kind)
                .ok()
                .flatten()
                .unwrap_or_else(|| ProviderSettings::defaults(kind, endpoint.to_string()))
        };

        if local_only {
            let ps = persisted(&store, ProviderKind::Local, "local://");
            registry.register(Arc::new(LocalProvider::new()), ps);
            let workload: Arc<dyn WorkloadExecutor> = Arc::new(LocalWorkloadExecutor::new());
            return Self::with_parts(settings, store, registry, workload);
        }

        if let Some(key) = settings.runpod_api_key.clone() {
            let ps = persisted(&store, ProviderKind::RunPod, &settings.runpod_api_url);
            registry.register(
                Arc::new(RunPodProvider::new(
                    ps.api_endpoint.clone(),
                    key,
                    ps.rate_limit_per_sec,
                )),
                ps,
            );
        }
        if let Some(key) = settings.vast_api_key.clone() {
            let ps = persisted(&store, ProviderKind::Vast, &settings.vast_api_url);
            registry.register(
                Arc::new(VastProvider::new(
                    ps.api_endpoint.clone(),
                    key,
                    ps.rate_limit_per_sec,
                )),
                ps,
            );
        }
        if registry.all().is_empty() {
            log::warn!("no provider credentials configured; nothing can be placed");
        }

        let workload: Arc<dyn WorkloadExecutor> =
            Arc::new(HttpWorkloadExecutor::new(std::time::Duration::from_secs(10)));
        Self::with_parts(settings, store, registry, workload)
    }

    pub fn ctx(&self) -> &Arc<OrchCtx> {
        &self.ctx
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.ctx.store
    }

    // -------------------------------------------------------------------------
    // Lifecycle of the service itself
    // -------------------------------------------------------------------------

    /// Spawn the scheduler and cleanup loops.
    pub fn start(&self) {
        tokio::spawn(Scheduler::run(self.ctx.clone()));
        tokio::spawn(Cleanup::run(self.ctx.clone()));
    }

    /// Signal every long-lived task to wind down.
    pub fn shutdown(&self) {
        let _ = self.ctx.shutdown.send(true);
    }

    // -------------------------------------------------------------------------
    // Job operations
    // -------------------------------------------------------------------------

    pub async fn submit_job(&self, principal: Principal, req: SubmitRequest) -> Result<JobTicket> {
        let job = self.ctx.admission.submit(principal, req).await?;
        self.ctx.submit_signal.notify_one();
        Ok(JobTicket {
            job_id: job.id,
            status: job.status,
            estimated_cost_usd: job.estimated_cost_usd,
        })
    }

    pub async fn submit_from_template(
        &self,
        principal: Principal,
        template_name: &str,
        overrides: SubmitRequest,
    ) -> Result<JobTicket> {
        let job = self
            .ctx
            .admission
            .submit_from_template(principal, template_name, overrides)
            .await?;
        self.ctx.submit_signal.notify_one();
        Ok(JobTicket {
            job_id: job.id,
            status: job.status,
            estimated_cost_usd: job.estimated_cost_usd,
        })
    }

    /// Fetch one job; other users' jobs are invisible, not forbidden.
    pub fn get_job(&self, principal: Principal, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .ctx
            .store
            .get_job(job_id)?
            .filter(|j| j.user_id == principal.user_id))
    }

    pub fn list_jobs(
        &self,
        principal: Principal,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>> {
        self.ctx
            .store
            .list_jobs(principal.user_id, status, limit.min(200), offset)
    }

    /// Idempotent cancel. Returns the job's status at call time; the
    /// terminal CANCELLED write lands synchronously for queued jobs and
    /// through the runner for in-flight ones.
    pub fn cancel_job(&self, principal: Principal, job_id: Uuid) -> Result<JobStatus> {
        let mut job = self
            .get_job(principal, job_id)?
            .ok_or_else(|| OrchestratorError::Validation(format!("job {job_id} not found")))?;

        if job.status.is_terminal() {
            return Ok(job.status);
        }

        // A live runner owns the lifecycle: deliver the signal and let it
        // terminate the instance and settle cost.
        let delivered = {
            let runners = self.ctx.active_runners.lock().unwrap();
            match runners.get(&job_id) {
                Some(tx) => tx.send(true).is_ok(),
                None => false,
            }
        };
        if delivered {
            log::info!("cancel signalled for job {job_id}");
            return Ok(job.status);
        }

        // Nothing owns it (still queued): terminalise right here.
        let committed = JobRunner::commit(&self.ctx, &mut job, |j| {
            j.status = JobStatus::Cancelled;
            j.completed_at = Some(chrono::Utc::now());
            j.actual_cost_usd = Some(0.0);
        })?;
        if committed {
            log::info!("job {job_id} cancelled while queued");
        }
        Ok(job.status)
    }

    /// Re-prioritise a job that is still waiting. Anything past QUEUED is
    /// already spending money and keeps its slot.
    pub fn update_priority(
        &self,
        principal: Principal,
        job_id: Uuid,
        new_priority: u8,
    ) -> Result<()> {
        if !(1..=10).contains(&new_priority) {
            return Err(OrchestratorError::Validation(format!(
                "priority must be within 1..10, got {new_priority}"
            )));
        }
        let mut job = self
            .get_job(principal, job_id)?
            .ok_or_else(|| OrchestratorError::Validation(format!("job {job_id} not found")))?;
        if job.status != JobStatus::Queued {
            return Err(OrchestratorError::Validation(format!(
                "job {job_id} is {}, priority is only mutable while queued",
                job.status
            )));
        }

        let committed = JobRunner::commit(&self.ctx, &mut job, |j| {
            j.priority = new_priority;
        })?;
        if !committed {
            return Err(OrchestratorError::Validation(format!(
                "job {job_id} left the queue during the update"
            )));
        }
        self.ctx.submit_signal.notify_one();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Status surfaces
    // -------------------------------------------------------------------------

    pub fn queue_status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            counts: self.ctx.store.status_counts()?,
            metrics: self.ctx.store.queue_metrics()?,
            running: self.ctx.store.running_summaries()?,
            queued_preview: self.ctx.store.queued_preview(20)?,
        })
    }

    pub fn quota_status(&self, principal: Principal) -> Result<QuotaStatus> {
        self.ctx.admission.quota_status(principal.user_id)
    }

    /// Health fan-out across every registered adapter; results are also
    /// stamped onto the persisted provider settings.
    pub async fn provider_status(&self) -> Result<Vec<ProviderHealth>> {
        let health = self.ctx.registry.health_all().await;
        for h in &health {
            let state = if h.healthy {
                crate::core::HealthState::Healthy
            } else {
                crate::core::HealthState::Unhealthy
            };
            self.ctx.store.record_health(h.provider, state, h.checked_at)?;
        }
        Ok(health)
    }

    pub async fn provider_pricing(&self, provider: ProviderKind) -> Result<Vec<GpuOffering>> {
        let adapter = self.ctx.registry.adapter(provider).ok_or_else(|| {
            OrchestratorError::Validation(format!("provider {provider} is not registered"))
        })?;
        Ok(adapter.list_offerings().await?.as_ref().clone())
    }

    // -------------------------------------------------------------------------
    // Templates
    // -------------------------------------------------------------------------

    pub fn create_template(&self, principal: Principal, spec: TemplateSpec) -> Result<JobTemplate> {
        if spec.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("template name is required".into()));
        }
        if spec.gpu_count < 1 || spec.max_runtime_minutes < 1 {
            return Err(OrchestratorError::Validation(
                "gpu_count and max_runtime_minutes must be >= 1".into(),
            ));
        }

        let now = chrono::Utc::now();
        let template = JobTemplate {
            id: Uuid::new_v4(),
            name: spec.name,
            description: spec.description,
            job_type: spec.job_type,
            model_name: spec.model_name,
            docker_image: spec.docker_image,
            gpu_type: spec.gpu_type,
            gpu_count: spec.gpu_count,
            memory_gb: spec.memory_gb,
            max_runtime_minutes: spec.max_runtime_minutes,
            default_env: spec.default_env,
            created_by: principal.user_id,
            created_at: now,
            updated_at: now,
            usage_count: 0,
            last_used_at: None,
        };
        self.ctx.store.insert_template(&template)?;
        log::info!("template '{}' created by {}", template.name, principal.user_id);
        Ok(template)
    }

    pub fn list_templates(&self) -> Result<Vec<JobTemplate>> {
        self.ctx.store.list_templates()
    }

    // -------------------------------------------------------------------------
    // Instances (operator surface)
    // -------------------------------------------------------------------------

    pub fn list_instances(&self, limit: u32) -> Result<Vec<Instance>> {
        self.ctx.store.list_instances(limit.min(500))
    }

    /// Forced terminate. The owning job's monitor will observe the death
    /// and the runner terminalises the job accordingly.
    pub async fn terminate_instance(&self, instance_id: Uuid) -> Result<bool> {
        let instance = self
            .ctx
            .store
            .get_instance(instance_id)?
            .ok_or_else(|| {
                OrchestratorError::Validation(format!("instance {instance_id} not found"))
            })?;
        let adapter = self.ctx.registry.adapter(instance.provider).ok_or_else(|| {
            OrchestratorError::Internal(format!("no adapter for {}", instance.provider))
        })?;
        JobRunner::teardown_instance(&self.ctx, adapter.as_ref(), instance_id).await;
        Ok(true)
    }
}

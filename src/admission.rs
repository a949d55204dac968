// src/admission.rs
//
// =============================================================================
// GPUFLOW: QUOTA & ADMISSION
// =============================================================================
//
// The front door. Everything a user submits passes through here before a
// Job row exists.
//
// The checklist, in order:
// 1. Backpressure gate (queue depth with hysteresis).
// 2. Shape validation (required fields, ranges).
// 3. Effective quota: the user's row, or defaults.
// 4. Concurrency / GPU-hours / dollars-per-day ceilings.
// 5. Allowed GPU types and providers.
// 6. Cost estimate via the cheapest capable adapter.
// 7. Priority boost, clamped into 1..10.
// 8. Persist as QUEUED.
//
// Template-based submission expands the template first; explicit override
// fields always win over template fields.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Settings;
use crate::core::{
    GpuType, Job, JobStatus, JobTemplate, JobType, Principal, QuotaStatus, ResourceQuota,
    SubmitRequest,
};
use crate::error::{OrchestratorError, Result};
use crate::providers::{ProviderRegistry, Verdict};
use crate::store::JobStore;

/// Submissions are refused above this queue depth...
const QUEUE_LIMIT: u64 = 1000;
/// ...and accepted again once the scheduler drains below this one.
const QUEUE_RESUME: u64 = 800;

pub struct AdmissionControl {
    store: Arc<JobStore>,
    registry: Arc<ProviderRegistry>,
    settings: Settings,
    gate_closed: AtomicBool,
}

impl AdmissionControl {
    pub fn new(store: Arc<JobStore>, registry: Arc<ProviderRegistry>, settings: Settings) -> Self {
        Self {
            store,
            registry,
            settings,
            gate_closed: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Submission
    // -------------------------------------------------------------------------

    pub async fn submit(&self, principal: Principal, req: SubmitRequest) -> Result<Job> {
        self.admit(principal, req, None).await
    }

    pub async fn submit_from_template(
        &self,
        principal: Principal,
        template_name: &str,
        overrides: SubmitRequest,
    ) -> Result<Job> {
        let template = self
            .store
            .get_template(template_name)?
            .ok_or_else(|| OrchestratorError::TemplateNotFound(template_name.to_string()))?;

        let merged = expand_template(&template, overrides);
        let job = self.admit(principal, merged, Some(template_name.to_string())).await?;
        self.store.record_template_use(template_name, Utc::now())?;
        Ok(job)
    }

    async fn admit(
        &self,
        principal: Principal,
        req: SubmitRequest,
        template_name: Option<String>,
    ) -> Result<Job> {
        self.check_backpressure()?;

        // --- Shape ----------------------------------------------------------
        let job_type = req
            .job_type
            .ok_or_else(|| OrchestratorError::Validation("job_type is required".into()))?;
        let model_name = req
            .model_name
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OrchestratorError::Validation("model_name is required".into()))?;

        let priority = req.priority.unwrap_or(5);
        if !(1..=10).contains(&priority) {
            return Err(OrchestratorError::Validation(format!(
                "priority must be within 1..10, got {priority}"
            )));
        }

        let (default_gpu, default_count, default_mem) = self.type_defaults(job_type);
        let gpu_type = req.gpu_type.unwrap_or(default_gpu);
        let gpu_count = req.gpu_count.unwrap_or(default_count);
        let memory_gb = req.memory_gb.unwrap_or(default_mem);
        let max_runtime_minutes = req.max_runtime_minutes.unwrap_or(60);

        if gpu_count < 1 {
            return Err(OrchestratorError::Validation("gpu_count must be >= 1".into()));
        }
        if max_runtime_minutes < 1 {
            return Err(OrchestratorError::Validation(
                "max_runtime_minutes must be >= 1".into(),
            ));
        }

        // --- Quota ----------------------------------------------------------
        let quota = self.effective_quota(principal.user_id)?;

        let active = self.store.count_user_active(principal.user_id)?;
        if active >= quota.max_concurrent_jobs as u64 {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "{active} of {} concurrent jobs in use",
                quota.max_concurrent_jobs
            )));
        }

        if !quota.allows_gpu_type(gpu_type) {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "GPU type {gpu_type} is not allowed for this account"
            )));
        }
        if !self
            .registry
            .enabled()
            .iter()
            .any(|e| quota.allows_provider(e.settings.provider))
        {
            return Err(OrchestratorError::QuotaExceeded(
                "no enabled provider is allowed for this account".into(),
            ));
        }

        let since = midnight_utc();
        let (gpu_hours_used, cost_used) = self.store.daily_usage(principal.user_id, since)?;

        let projected_hours = max_runtime_minutes as f64 / 60.0 * gpu_count as f64;
        if gpu_hours_used + projected_hours > quota.max_gpu_hours_per_day {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "daily GPU-hours budget exhausted ({:.1}h used + {:.1}h projected > {:.1}h)",
                gpu_hours_used, projected_hours, quota.max_gpu_hours_per_day
            )));
        }

        // --- Cost estimate (cheapest capable adapter) -----------------------
        let estimated_cost_usd = self
            .cheapest_estimate(&quota, gpu_type, gpu_count, max_runtime_minutes)
            .await;

        if cost_used + estimated_cost_usd > quota.max_cost_per_day_usd {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "daily cost budget exhausted (${:.2} used + ${:.2} estimated > ${:.2})",
                cost_used, estimated_cost_usd, quota.max_cost_per_day_usd
            )));
        }

        // --- Priority boost -------------------------------------------------
        let effective_priority =
            (priority as i32 - quota.priority_boost).clamp(1, 10) as u8;

        // --- Persist --------------------------------------------------------
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            user_id: principal.user_id,
            job_type,
            model_name,
            template_name,
            priority: effective_priority,
            gpu_type,
            gpu_count,
            memory_gb,
            max_runtime_minutes,
            input: if req.input.is_null() { json!({}) } else { req.input },
            output: None,
            error_message: None,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            estimated_completion_at: None,
            estimated_cost_usd,
            actual_cost_usd: None,
            retry_count: 0,
            max_retries: req.max_retries.unwrap_or(3),
            backoff_until: None,
            instance_id: None,
            version: 0,
        };
        self.store.insert_job(&job)?;

        log::info!(
            "job {} admitted: user={} type={} {}x{} prio={} est=${:.2}",
            job.id,
            job.user_id,
            job.job_type.as_str(),
            job.gpu_count,
            job.gpu_type,
            job.priority,
            job.estimated_cost_usd
        );
        Ok(job)
    }

    // -------------------------------------------------------------------------
    // Quota resolution & status
    // -------------------------------------------------------------------------

    pub fn effective_quota(&self, user_id: Uuid) -> Result<ResourceQuota> {
        Ok(self
            .store
            .get_quota(user_id)?
            .unwrap_or_else(|| ResourceQuota::default_for(user_id)))
    }

    pub fn quota_status(&self, user_id: Uuid) -> Result<QuotaStatus> {
        let quota = self.effective_quota(user_id)?;
        let current = self.store.count_user_active(user_id)?;
        let (gpu_hours, cost) = self.store.daily_usage(user_id, midnight_utc())?;

        Ok(QuotaStatus {
            user_id,
            max_concurrent_jobs: quota.max_concurrent_jobs,
            max_gpu_hours_per_day: quota.max_gpu_hours_per_day,
            max_cost_per_day_usd: quota.max_cost_per_day_usd,
            current_concurrent_jobs: current,
            gpu_hours_used_today: gpu_hours,
            cost_used_today_usd: cost,
            quota_exceeded: current >= quota.max_concurrent_jobs as u64
                || gpu_hours >= quota.max_gpu_hours_per_day
                || cost >= quota.max_cost_per_day_usd,
        })
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Queue-depth gate with hysteresis: closes at the limit, reopens only
    /// after the scheduler drains below the resume mark.
    fn check_backpressure(&self) -> Result<()> {
        let queued = self.store.count_queued()?;

        if self.gate_closed.load(Ordering::Acquire) {
            if queued <= QUEUE_RESUME {
                self.gate_closed.store(false, Ordering::Release);
                log::info!("admission gate reopened ({queued} queued)");
            } else {
                return Err(OrchestratorError::QueueFull { queued });
            }
        } else if queued >= QUEUE_LIMIT {
            self.gate_closed.store(true, Ordering::Release);
            log::warn!("admission gate closed ({queued} queued)");
            return Err(OrchestratorError::QueueFull { queued });
        }
        Ok(())
    }

    /// Default hardware per job type when the request does not say.
    fn type_defaults(&self, job_type: JobType) -> (GpuType, u32, u32) {
        match job_type {
            JobType::LlavaInference => (GpuType::Rtx4090, 4, 96),
            JobType::LlamaInference => (GpuType::Rtx4090, 2, 48),
            JobType::Training => (GpuType::A100, 1, 80),
            JobType::Batch => (GpuType::Rtx4090, 1, 24),
            JobType::Custom => (self.settings.default_gpu_type, 1, 24),
        }
    }

    /// Cheapest quote among the enabled adapters this user may reach. A
    /// request nothing can quote falls back to a flat $1/GPU-hour so the
    /// job can still queue (placement gives the final answer).
    async fn cheapest_estimate(
        &self,
        quota: &ResourceQuota,
        gpu_type: GpuType,
        gpu_count: u32,
        runtime_minutes: u32,
    ) -> f64 {
        let probe = Job {
            // Only the resource fields matter to validate_requirements.
            id: Uuid::nil(),
            user_id: quota.user_id,
            job_type: JobType::Custom,
            model_name: String::new(),
            template_name: None,
            priority: 5,
            gpu_type,
            gpu_count,
            memory_gb: 0,
            max_runtime_minutes: runtime_minutes,
            input: Value::Null,
            output: None,
            error_message: None,
            status: JobStatus::Queued,
            progress_percent: 0.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            estimated_completion_at: None,
            estimated_cost_usd: 0.0,
            actual_cost_usd: None,
            retry_count: 0,
            max_retries: 0,
            backoff_until: None,
            instance_id: None,
            version: 0,
        };

        let mut cheapest: Option<f64> = None;
        for entry in self.registry.enabled() {
            if !quota.allows_provider(entry.settings.provider) {
                continue;
            }
            let capable = matches!(
                entry
                    .adapter
                    .validate_requirements(&probe, gpu_type, gpu_count)
                    .await,
                Ok(Verdict::Eligible)
            );
            if !capable {
                continue;
            }
            if let Ok(cost) = entry
                .adapter
                .estimate_cost(gpu_type, gpu_count, runtime_minutes)
                .await
            {
                cheapest = Some(cheapest.map_or(cost, |c: f64| c.min(cost)));
            }
        }

        cheapest.unwrap_or_else(|| gpu_count as f64 * runtime_minutes as f64 / 60.0)
    }
}

/// Template expansion: the template fills every field the override set
/// leaves blank; overrides win wherever both speak.
fn expand_template(template: &JobTemplate, overrides: SubmitRequest) -> SubmitRequest {
    let mut input = if overrides.input.is_null() {
        json!({})
    } else {
        overrides.input
    };

    // The template's default environment seeds input.environment without
    // clobbering caller-supplied entries.
    if !template.default_env.is_empty() {
        let env = input
            .as_object_mut()
            .map(|obj| {
                obj.entry("environment")
                    .or_insert_with(|| json!({}))
            });
        if let Some(Value::Object(env)) = env {
            for (k, v) in &template.default_env {
                env.entry(k.clone()).or_insert_with(|| json!(v));
            }
        }
    }

    SubmitRequest {
        job_type: overrides.job_type.or(Some(template.job_type)),
        model_name: overrides.model_name.or_else(|| Some(template.model_name.clone())),
        input,
        priority: overrides.priority,
        gpu_type: overrides.gpu_type.or(Some(template.gpu_type)),
        gpu_count: overrides.gpu_count.or(Some(template.gpu_count)),
        memory_gb: overrides.memory_gb.or(Some(template.memory_gb)),
        max_runtime_minutes: overrides
            .max_runtime_minutes
            .or(Some(template.max_runtime_minutes)),
        max_retries: overrides.max_retries,
    }
}

fn midnight_utc() -> chrono::DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| chrono::DateTime::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or_else(Utc::now)
}

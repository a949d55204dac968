// src/core.rs
//
// =============================================================================
// GPUFLOW: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The shared vocabulary of the orchestrator.
// This file defines the strict data contracts between the scheduler, the
// provider adapters and the persistence layer.
//
// Design Principles:
// 1. Closed Sum Types: every status/kind is an enum with a stable on-disk
//    string encoding. No free-floating strings.
// 2. Explicit ownership: Job -> Instance is a plain foreign key, fetched
//    at the query site. No lazy graph traversal.
// 3. Opaque bags stay opaque: job input/output and provider metadata are
//    `serde_json::Value` and never interpreted by the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

// ============================================================================
// 1. PROVIDERS & HARDWARE
// ============================================================================

/// The GPU clouds this orchestrator can rent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    RunPod,
    Vast,
    /// In-process simulator. Used for development and the test-suite.
    Local,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::RunPod => "runpod",
            ProviderKind::Vast => "vast",
            ProviderKind::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "runpod" => Ok(ProviderKind::RunPod),
            "vast" => Ok(ProviderKind::Vast),
            "local" => Ok(ProviderKind::Local),
            other => Err(OrchestratorError::Database(format!(
                "unknown provider kind '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// GPU hardware classes. The encoding matches the marketing names used in
/// provider price lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuType {
    #[serde(rename = "RTX4090")]
    Rtx4090,
    #[serde(rename = "RTX3090")]
    Rtx3090,
    #[serde(rename = "A100")]
    A100,
    #[serde(rename = "H100")]
    H100,
    #[serde(rename = "V100")]
    V100,
    #[serde(rename = "T4")]
    T4,
}

impl GpuType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuType::Rtx4090 => "RTX4090",
            GpuType::Rtx3090 => "RTX3090",
            GpuType::A100 => "A100",
            GpuType::H100 => "H100",
            GpuType::V100 => "V100",
            GpuType::T4 => "T4",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RTX4090" => Ok(GpuType::Rtx4090),
            "RTX3090" => Ok(GpuType::Rtx3090),
            "A100" => Ok(GpuType::A100),
            "H100" => Ok(GpuType::H100),
            "V100" => Ok(GpuType::V100),
            "T4" => Ok(GpuType::T4),
            other => Err(OrchestratorError::Validation(format!(
                "unknown GPU type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

// ============================================================================
// 2. JOBS (The Unit of Work)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    LlavaInference,
    LlamaInference,
    Training,
    Batch,
    Custom,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::LlavaInference => "llava_inference",
            JobType::LlamaInference => "llama_inference",
            JobType::Training => "training",
            JobType::Batch => "batch",
            JobType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "timeout" => Ok(JobStatus::Timeout),
            other => Err(OrchestratorError::Database(format!(
                "unknown job status '{other}'"
            ))),
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    /// Active = holds (or will hold) capacity: counted against quotas.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Assigned | JobStatus::Running
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,

    // What to run
    pub job_type: JobType,
    pub model_name: String,
    #[serde(default)]
    pub template_name: Option<String>,

    /// Effective priority, 1 (highest) .. 10. Admission applies the quota
    /// boost before persisting; aging is computed at dispatch time.
    pub priority: u8,

    // Resource requirements
    pub gpu_type: GpuType,
    pub gpu_count: u32,
    pub memory_gb: u32,
    pub max_runtime_minutes: u32,

    // Payload
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,

    // Lifecycle
    pub status: JobStatus,
    pub progress_percent: f32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion_at: Option<DateTime<Utc>>,

    // Cost
    pub estimated_cost_usd: f64,
    pub actual_cost_usd: Option<f64>,

    // Retry
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest next dispatch after a transient failure.
    #[serde(default)]
    pub backoff_until: Option<DateTime<Utc>>,

    /// Owning instance while ASSIGNED/RUNNING.
    pub instance_id: Option<Uuid>,

    /// Optimistic concurrency counter; bumped by every guarded write.
    #[serde(default)]
    pub version: i64,
}

impl Job {
    /// Runtime in hours once both endpoints exist, otherwise zero.
    pub fn runtime_hours(&self) -> f64 {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => ((c - s).num_milliseconds().max(0) as f64) / 3_600_000.0,
            _ => 0.0,
        }
    }

    /// Wall-clock budget for the RUNNING phase (10% grace over the
    /// requested runtime).
    pub fn run_deadline_secs(&self) -> u64 {
        (self.max_runtime_minutes as f64 * 60.0 * 1.1).ceil() as u64
    }
}

// ============================================================================
// 3. INSTANCES (The Rented Box)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Terminated,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "starting" => Ok(InstanceStatus::Starting),
            "running" => Ok(InstanceStatus::Running),
            "stopping" => Ok(InstanceStatus::Stopping),
            "stopped" => Ok(InstanceStatus::Stopped),
            "terminated" => Ok(InstanceStatus::Terminated),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(OrchestratorError::Database(format!(
                "unknown instance status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Terminated | InstanceStatus::Failed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub provider: ProviderKind,
    /// The provider's own identifier. Unique per provider across all time.
    pub provider_instance_id: String,

    pub gpu_type: GpuType,
    pub gpu_count: u32,
    pub memory_gb: u32,
    pub vcpus: u32,
    pub storage_gb: u32,

    pub status: InstanceStatus,

    // Network (unknown until the box is RUNNING)
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub ssh_port: Option<u16>,
    pub api_port: Option<u16>,

    // Cost
    pub hourly_cost_usd: f64,
    /// Monotone non-decreasing accrual; fixed at terminalisation.
    pub total_cost_usd: f64,

    // Launch configuration
    pub docker_image: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub startup_script: Option<String>,
    pub region: Option<String>,
    pub preemptible: bool,
    pub auto_terminate_minutes: Option<u32>,

    /// Raw provider payload, never interpreted here.
    #[serde(default)]
    pub provider_metadata: Value,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Instance {
    /// Final cost: hourly rate over the started..stopped window.
    pub fn settled_cost(&self) -> f64 {
        match (self.started_at, self.stopped_at) {
            (Some(s), Some(e)) => {
                let hours = ((e - s).num_milliseconds().max(0) as f64) / 3_600_000.0;
                self.hourly_cost_usd * hours
            }
            _ => 0.0,
        }
    }
}

// ============================================================================
// 4. PLACEMENT & LAUNCH OPTIONS
// ============================================================================

/// One row of a provider price list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuOffering {
    pub gpu_type: GpuType,
    pub memory_gb: u32,
    pub hourly_price_usd: f64,
    pub spot_price_usd: Option<f64>,
    pub available_count: u32,
    pub regions: Vec<String>,
}

/// Closed options record for instance creation. Unknown options are a
/// compile error here, not a silently ignored kwarg.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchOptions {
    pub region: Option<String>,
    pub storage_gb: Option<u32>,
    pub container_disk_gb: Option<u32>,
    pub use_spot: bool,
    pub api_endpoint: Option<String>,
}

/// The placement decision for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placement {
    pub provider: ProviderKind,
    pub gpu_type: GpuType,
    pub gpu_count: u32,
    pub region: Option<String>,
    pub estimated_cost_usd: f64,
}

// ============================================================================
// 5. TEMPLATES, QUOTAS, PROVIDER SETTINGS
// ============================================================================

/// Named default bundle for a job type/model. Immutable once referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: Uuid,
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

    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Per-user limits. A missing row means `ResourceQuota::default_for(user)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub user_id: Uuid,
    pub max_concurrent_jobs: u32,
    pub max_gpu_hours_per_day: f64,
    pub max_cost_per_day_usd: f64,
    pub max_instances_per_provider: u32,
    /// Empty = all types allowed.
    #[serde(default)]
    pub allowed_gpu_types: Vec<GpuType>,
    /// Empty = all providers allowed.
    #[serde(default)]
    pub allowed_providers: Vec<ProviderKind>,
    /// Subtracted from the requested priority at admission (clamped 1..10).
    pub priority_boost: i32,
}

impl ResourceQuota {
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            max_concurrent_jobs: 5,
            max_gpu_hours_per_day: 24.0,
            max_cost_per_day_usd: 100.0,
            max_instances_per_provider: 3,
            allowed_gpu_types: Vec::new(),
            allowed_providers: Vec::new(),
            priority_boost: 0,
        }
    }

    pub fn allows_gpu_type(&self, gpu: GpuType) -> bool {
        self.allowed_gpu_types.is_empty() || self.allowed_gpu_types.contains(&gpu)
    }

    pub fn allows_provider(&self, provider: ProviderKind) -> bool {
        self.allowed_providers.is_empty() || self.allowed_providers.contains(&provider)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Per-provider operational configuration, persisted and auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub provider: ProviderKind,
    pub enabled: bool,
    /// Tiebreak: lower wins.
    pub priority: u8,
    pub max_instances: u32,
    pub max_hourly_cost_usd: f64,
    pub api_endpoint: String,
    /// Encrypted credential blob. Encryption is the config service's
    /// concern; this column only carries it.
    pub api_key_encrypted: Option<String>,
    pub default_region: Option<String>,
    /// Requests per second granted to this adapter's token bucket.
    pub rate_limit_per_sec: f64,
    #[serde(default)]
    pub settings: Value,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthState,
}

impl ProviderSettings {
    pub fn defaults(provider: ProviderKind, api_endpoint: String) -> Self {
        Self {
            provider,
            enabled: true,
            priority: 5,
            max_instances: 5,
            max_hourly_cost_usd: 10.0,
            api_endpoint,
            api_key_encrypted: None,
            default_region: None,
            rate_limit_per_sec: 5.0,
            settings: Value::Null,
            last_health_check: None,
            health_status: HealthState::Unknown,
        }
    }
}

// ============================================================================
// 6. REQUEST & VIEW MODELS
// ============================================================================

/// The authenticated caller. Token verification happens upstream; by the
/// time the core runs, the principal is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
}

/// Submission payload. Every field is optional so the same record doubles
/// as the override set for template-based submission; direct submission
/// requires `job_type` and `model_name`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub job_type: Option<JobType>,
    pub model_name: Option<String>,
    #[serde(default)]
    pub input: Value,
    pub priority: Option<u8>,
    pub gpu_type: Option<GpuType>,
    pub gpu_count: Option<u32>,
    pub memory_gb: Option<u32>,
    pub max_runtime_minutes: Option<u32>,
    pub max_retries: Option<u32>,
}

/// What the caller gets back from a successful submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub estimated_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_type: JobType,
    pub model_name: String,
    pub priority: u8,
    pub status: JobStatus,
    pub progress_percent: f32,
    pub created_at: DateTime<Utc>,
    pub estimated_cost_usd: f64,
    pub actual_cost_usd: Option<f64>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            user_id: job.user_id,
            job_type: job.job_type,
            model_name: job.model_name.clone(),
            priority: job.priority,
            status: job.status,
            progress_percent: job.progress_percent,
            created_at: job.created_at,
            estimated_cost_usd: job.estimated_cost_usd,
            actual_cost_usd: job.actual_cost_usd,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub average_wait_minutes: f64,
    pub average_execution_minutes: f64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub counts: HashMap<JobStatus, u64>,
    pub metrics: QueueMetrics,
    pub running: Vec<JobSummary>,
    /// Next jobs in dispatch order (bounded preview).
    pub queued_preview: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub user_id: Uuid,
    pub max_concurrent_jobs: u32,
    pub max_gpu_hours_per_day: f64,
    pub max_cost_per_day_usd: f64,
    pub current_concurrent_jobs: u64,
    pub gpu_hours_used_today: f64,
    pub cost_used_today_usd: f64,
    pub quota_exceeded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: ProviderKind,
    pub healthy: bool,
    pub latency_ms: u64,
    pub offerings_count: usize,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

// src/providers.rs
//
// =============================================================================
// GPUFLOW: PROVIDER MODULE & INTERFACE
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define the `GpuProvider` trait (The Contract).
// 2. Hold the registry mapping `ProviderKind` to concrete adapters.
// 3. Provide standardized utilities shared by all adapters: bounded
//    retry with deadline, per-provider token-bucket rate limiting, the
//    60 s price-list cache, and idempotency-token derivation.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{
    GpuOffering, GpuType, Instance, InstanceStatus, Job, LaunchOptions, ProviderHealth,
    ProviderKind, ProviderSettings,
};
use crate::error::Result;

// Declare the concrete implementations
pub mod local;
pub mod runpod;
pub mod vast;

// ============================================================================
// 1. THE PROVIDER TRAIT (The Contract)
// ============================================================================

/// Why an otherwise reachable provider cannot take a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    UnsupportedGpu(GpuType),
    InsufficientAvailability {
        gpu: GpuType,
        need: u32,
        have: u32,
    },
    OverBudget {
        estimated: f64,
        budget: f64,
    },
    ProviderDisabled,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::UnsupportedGpu(gpu) => write!(f, "GPU type {gpu} not supported"),
            Rejection::InsufficientAvailability { gpu, need, have } => {
                write!(f, "insufficient {gpu} availability (need {need}, have {have})")
            }
            Rejection::OverBudget { estimated, budget } => {
                write!(f, "estimated ${estimated:.2} exceeds budget ${budget:.2}")
            }
            Rejection::ProviderDisabled => write!(f, "provider disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Eligible,
    Rejected(Rejection),
}

/// One status poll, mapped into the canonical model. Providers that learn
/// the endpoint lazily (RunPod ports appear only once the pod runs) report
/// it here so the monitor can persist it.
#[derive(Debug, Clone)]
pub struct InstanceProbe {
    pub status: InstanceStatus,
    pub public_ip: Option<String>,
    pub api_port: Option<u16>,
}

#[async_trait]
pub trait GpuProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Current price list. Implementations serve from their cache (60 s
    /// freshness is acceptable) and refresh on miss.
    async fn list_offerings(&self) -> Result<Arc<Vec<GpuOffering>>>;

    /// Dollar estimate, monotone in every argument.
    async fn estimate_cost(
        &self,
        gpu_type: GpuType,
        gpu_count: u32,
        runtime_minutes: u32,
    ) -> Result<f64>;

    /// Rent a box. `token` is the client-supplied idempotency token; an
    /// adapter seeing a live instance tagged with the same token returns
    /// it instead of renting twice.
    async fn create_instance(
        &self,
        job: &Job,
        gpu_type: GpuType,
        gpu_count: u32,
        opts: &LaunchOptions,
        token: &str,
    ) -> Result<Instance>;

    /// Idempotent terminate intent. `true` means the provider accepted it;
    /// the final state flows through `probe_instance`.
    async fn terminate_instance(&self, instance: &Instance) -> Result<bool>;

    /// Poll the provider and map its state into the canonical set.
    async fn probe_instance(&self, instance: &Instance) -> Result<InstanceProbe>;

    /// Most recent observed round-trip to the provider API.
    fn latency_ms(&self) -> u64;
    fn note_latency(&self, ms: u64);

    /// Can this provider satisfy the job? Mirrors the price list, so the
    /// answer is only as fresh as the cache.
    async fn validate_requirements(
        &self,
        job: &Job,
        gpu_type: GpuType,
        gpu_count: u32,
    ) -> Result<Verdict> {
        let offerings = self.list_offerings().await?;

        let Some(offer) = offerings.iter().find(|o| o.gpu_type == gpu_type) else {
            return Ok(Verdict::Rejected(Rejection::UnsupportedGpu(gpu_type)));
        };
        if offer.available_count < gpu_count {
            return Ok(Verdict::Rejected(Rejection::InsufficientAvailability {
                gpu: gpu_type,
                need: gpu_count,
                have: offer.available_count,
            }));
        }

        // Budget guard: 50% buffer over the admission-time estimate. A job
        // without an estimate yet (admission itself) skips the check.
        if job.estimated_cost_usd > 0.0 {
            let estimated = self
                .estimate_cost(gpu_type, gpu_count, job.max_runtime_minutes)
                .await?;
            let budget = job.estimated_cost_usd * 1.5;
            if estimated > budget {
                return Ok(Verdict::Rejected(Rejection::OverBudget { estimated, budget }));
            }
        }

        Ok(Verdict::Eligible)
    }

    /// Probe the provider by fetching its price list.
    async fn health_check(&self) -> ProviderHealth {
        let t0 = std::time::Instant::now();
        match self.list_offerings().await {
            Ok(offerings) => {
                let latency = t0.elapsed().as_millis() as u64;
                self.note_latency(latency);
                ProviderHealth {
                    provider: self.kind(),
                    healthy: true,
                    latency_ms: latency,
                    offerings_count: offerings.len(),
                    error: None,
                    checked_at: Utc::now(),
                }
            }
            Err(e) => ProviderHealth {
                provider: self.kind(),
                healthy: false,
                latency_ms: t0.elapsed().as_millis() as u64,
                offerings_count: 0,
                error: Some(e.to_string()),
                checked_at: Utc::now(),
            },
        }
    }
}

// ============================================================================
// 2. THE REGISTRY (The Dispatcher)
// ============================================================================

pub struct ProviderEntry {
    pub adapter: Arc<dyn GpuProvider>,
    pub settings: ProviderSettings,
}

/// Immutable after boot. Settings changes go through persistence and take
/// effect on restart; health status is stamped onto the store separately.
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn GpuProvider>, settings: ProviderSettings) {
        log::info!(
            "provider registered: {} (enabled={}, priority={})",
            settings.provider,
            settings.enabled,
            settings.priority
        );
        self.entries.push(ProviderEntry { adapter, settings });
        self.entries.sort_by_key(|e| e.settings.priority);
    }

    /// Adapter lookup regardless of the enabled flag. Termination of an
    /// already-rented instance must work even after an operator disables
    /// the provider.
    pub fn adapter(&self, kind: ProviderKind) -> Option<Arc<dyn GpuProvider>> {
        self.entries
            .iter()
            .find(|e| e.settings.provider == kind)
            .map(|e| e.adapter.clone())
    }

    /// Enabled adapters in priority order.
    pub fn enabled(&self) -> Vec<&ProviderEntry> {
        self.entries.iter().filter(|e| e.settings.enabled).collect()
    }

    pub fn all(&self) -> &[ProviderEntry] {
        &self.entries
    }

    pub async fn health_all(&self) -> Vec<ProviderHealth> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            out.push(entry.adapter.health_check().await);
        }
        out
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 3. SHARED ADAPTER PLUMBING
// ============================================================================

pub mod util {
    use super::*;
    use crate::error::OrchestratorError;
    use sha2::{Digest, Sha256};
    use std::future::Future;
    use std::time::{Duration, Instant};
    use tokio::sync::Mutex;
    use tokio::time::{sleep, timeout};
    use uuid::Uuid;

    /// Every provider call runs under this deadline.
    pub const PROVIDER_DEADLINE: Duration = Duration::from_secs(30);
    /// Transient failures retry up to this many attempts total.
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Bounded retry with exponential backoff. Transient classes (network,
    /// 5xx, deadline) are retried; permanent classes surface immediately.
    pub async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_millis(500);
        let mut last = OrchestratorError::Provider(format!("{op}: no attempts made"));

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = match timeout(PROVIDER_DEADLINE, call()).await {
                Ok(res) => res,
                Err(_) => Err(OrchestratorError::Provider(format!(
                    "{op}: deadline of {}s exceeded",
                    PROVIDER_DEADLINE.as_secs()
                ))),
            };

            match outcome {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    log::warn!("{op} attempt {attempt}/{MAX_ATTEMPTS} failed: {e}");
                    last = e;
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Client-supplied creation token: stable for a given (job, attempt)
    /// pair so a retried create lands on the same rental.
    pub fn idempotency_token(job_id: Uuid, attempt: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(job_id.as_bytes());
        hasher.update(attempt.to_le_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..32].to_string()
    }

    // -------------------------------------------------------------------------
    // Token bucket, shared by all tasks using one adapter
    // -------------------------------------------------------------------------

    struct Bucket {
        tokens: f64,
        capacity: f64,
        refill_per_sec: f64,
        last_refill: Instant,
    }

    pub struct RateLimiter {
        bucket: Mutex<Bucket>,
    }

    impl RateLimiter {
        pub fn new(rate_per_sec: f64, burst: f64) -> Self {
            Self {
                bucket: Mutex::new(Bucket {
                    tokens: burst,
                    capacity: burst,
                    refill_per_sec: rate_per_sec.max(0.1),
                    last_refill: Instant::now(),
                }),
            }
        }

        /// Take one token, sleeping until the bucket refills. The lock is
        /// never held across the sleep.
        pub async fn acquire(&self) {
            loop {
                let wait = {
                    let mut b = self.bucket.lock().await;
                    let elapsed = b.last_refill.elapsed().as_secs_f64();
                    b.tokens = (b.tokens + elapsed * b.refill_per_sec).min(b.capacity);
                    b.last_refill = Instant::now();
                    if b.tokens >= 1.0 {
                        b.tokens -= 1.0;
                        return;
                    }
                    Duration::from_secs_f64((1.0 - b.tokens) / b.refill_per_sec)
                };
                sleep(wait).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Price-list cache (60 s TTL, copy-on-write reads)
    // -------------------------------------------------------------------------

    pub struct PriceCache {
        ttl: Duration,
        slot: std::sync::Mutex<Option<(Instant, Arc<Vec<GpuOffering>>)>>,
    }

    impl PriceCache {
        pub fn new(ttl: Duration) -> Self {
            Self {
                ttl,
                slot: std::sync::Mutex::new(None),
            }
        }

        /// Readers clone the Arc out; writers swap in a fresh snapshot.
        pub fn get(&self) -> Option<Arc<Vec<GpuOffering>>> {
            let slot = self.slot.lock().unwrap();
            match &*slot {
                Some((at, snapshot)) if at.elapsed() < self.ttl => Some(snapshot.clone()),
                _ => None,
            }
        }

        pub fn put(&self, offerings: Arc<Vec<GpuOffering>>) {
            *self.slot.lock().unwrap() = Some((Instant::now(), offerings));
        }
    }
}

/// Shared scaffold for latency tracking; adapters embed this.
pub struct LatencyGauge(AtomicU64);

impl LatencyGauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::Relaxed);
    }
}

impl Default for LatencyGauge {
    fn default() -> Self {
        Self::new()
    }
}

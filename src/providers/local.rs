// src/providers/local.rs
//
// =============================================================================
// GPUFLOW: LOCAL SIMULATOR
// =============================================================================
//
// A deterministic in-process provider. No network, no money.
//
// Used by `start --local` for development and by the test-suite, which
// scripts its price table, startup latency and failure injection to walk
// jobs through every corner of the lifecycle.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
// tokio's Instant so simulated startup latency cooperates with paused
// test clocks.
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::{
    GpuOffering, GpuType, Instance, InstanceStatus, Job, LaunchOptions, ProviderKind,
};
use crate::error::{OrchestratorError, Result};
use crate::providers::{GpuProvider, InstanceProbe, LatencyGauge};

/// Which error class an injected create failure raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectKind {
    Transient,
    Permanent,
    Insufficient,
}

struct SimInstance {
    created: Instant,
    ready_after: Duration,
    terminated: bool,
    failed: bool,
}

struct SimState {
    instances: HashMap<String, SimInstance>,
    /// Idempotency-token -> provider instance id.
    tokens: HashMap<String, String>,
    pending_failures: Vec<InjectKind>,
    startup_delay: Duration,
    /// Never reach RUNNING (readiness-timeout scenarios).
    stuck_in_starting: bool,
    created_total: u64,
}

pub struct LocalProvider {
    kind: ProviderKind,
    prices: Mutex<HashMap<GpuType, f64>>,
    availability: Mutex<HashMap<GpuType, u32>>,
    state: Mutex<SimState>,
    counter: AtomicU64,
    latency: LatencyGauge,
}

impl LocalProvider {
    /// Simulator answering for a different provider kind; lets one test
    /// pit several scripted "clouds" against each other.
    pub fn masquerading(kind: ProviderKind) -> Self {
        Self {
            kind,
            ..Self::new()
        }
    }

    pub fn new() -> Self {
        let mut prices = HashMap::new();
        prices.insert(GpuType::Rtx4090, 0.50);
        prices.insert(GpuType::Rtx3090, 0.40);
        prices.insert(GpuType::A100, 2.50);
        prices.insert(GpuType::H100, 4.00);
        prices.insert(GpuType::V100, 1.50);
        prices.insert(GpuType::T4, 0.30);

        let mut availability = HashMap::new();
        for gpu in prices.keys() {
            availability.insert(*gpu, 16);
        }

        Self {
            kind: ProviderKind::Local,
            prices: Mutex::new(prices),
            availability: Mutex::new(availability),
            state: Mutex::new(SimState {
                instances: HashMap::new(),
                tokens: HashMap::new(),
                pending_failures: Vec::new(),
                startup_delay: Duration::from_millis(20),
                stuck_in_starting: false,
                created_total: 0,
            }),
            counter: AtomicU64::new(0),
            latency: LatencyGauge::new(),
        }
    }

    // --- Test/ops knobs ------------------------------------------------------

    pub fn set_price(&self, gpu: GpuType, hourly_usd: f64) {
        self.prices.lock().unwrap().insert(gpu, hourly_usd);
    }

    pub fn set_availability(&self, gpu: GpuType, count: u32) {
        self.availability.lock().unwrap().insert(gpu, count);
    }

    pub fn set_startup_delay(&self, delay: Duration) {
        self.state.lock().unwrap().startup_delay = delay;
    }

    pub fn stick_in_starting(&self, stuck: bool) {
        self.state.lock().unwrap().stuck_in_starting = stuck;
    }

    /// Queue up create failures; each create consumes one.
    pub fn inject_create_failures(&self, count: u32, kind: InjectKind) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.pending_failures.push(kind);
        }
    }

    /// Simulate the box dying under the job.
    pub fn mark_failed(&self, provider_instance_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(inst) = state.instances.get_mut(provider_instance_id) {
            inst.failed = true;
        }
    }

    pub fn set_latency_ms(&self, ms: u64) {
        self.latency.set(ms);
    }

    pub fn created_total(&self) -> u64 {
        self.state.lock().unwrap().created_total
    }

    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|i| !i.terminated && !i.failed)
            .count()
    }

    fn hourly(&self, gpu: GpuType) -> f64 {
        *self.prices.lock().unwrap().get(&gpu).unwrap_or(&1.0)
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn list_offerings(&self) -> Result<Arc<Vec<GpuOffering>>> {
        let prices = self.prices.lock().unwrap().clone();
        let availability = self.availability.lock().unwrap().clone();
        let mut offerings: Vec<GpuOffering> = prices
            .into_iter()
            .map(|(gpu_type, hourly)| GpuOffering {
                gpu_type,
                memory_gb: match gpu_type {
                    GpuType::Rtx4090 | GpuType::Rtx3090 => 24,
                    GpuType::A100 | GpuType::H100 => 80,
                    GpuType::V100 => 32,
                    GpuType::T4 => 16,
                },
                hourly_price_usd: hourly,
                spot_price_usd: Some(hourly * 0.8),
                available_count: *availability.get(&gpu_type).unwrap_or(&0),
                regions: vec!["local".to_string()],
            })
            .collect();
        offerings.sort_by_key(|o| o.gpu_type.as_str());
        Ok(Arc::new(offerings))
    }

    async fn estimate_cost(
        &self,
        gpu_type: GpuType,
        gpu_count: u32,
        runtime_minutes: u32,
    ) -> Result<f64> {
        Ok(self.hourly(gpu_type) * gpu_count as f64 * runtime_minutes as f64 / 60.0)
    }

    async fn create_instance(
        &self,
        _job: &Job,
        gpu_type: GpuType,
        gpu_count: u32,
        opts: &LaunchOptions,
        token: &str,
    ) -> Result<Instance> {
        let pid = {
            let mut state = self.state.lock().unwrap();

            if let Some(kind) = state.pending_failures.pop() {
                return Err(match kind {
                    InjectKind::Transient => {
                        OrchestratorError::Provider("injected transient failure".into())
                    }
                    InjectKind::Permanent => {
                        OrchestratorError::ProviderPermanent("injected rejection".into())
                    }
                    InjectKind::Insufficient => {
                        OrchestratorError::InsufficientResources("injected shortage".into())
                    }
                });
            }

            // Idempotent replay: same token, same rental.
            if let Some(existing) = state.tokens.get(token).cloned() {
                existing
            } else {
                let pid = format!("local-{}", self.counter.fetch_add(1, Ordering::SeqCst));
                let ready_after = state.startup_delay;
                state.instances.insert(
                    pid.clone(),
                    SimInstance {
                        created: Instant::now(),
                        ready_after,
                        terminated: false,
                        failed: false,
                    },
                );
                state.tokens.insert(token.to_string(), pid.clone());
                state.created_total += 1;
                pid
            }
        };

        Ok(Instance {
            id: Uuid::new_v4(),
            provider: self.kind,
            provider_instance_id: pid.clone(),
            gpu_type,
            gpu_count,
            memory_gb: 24 * gpu_count,
            vcpus: 8 * gpu_count,
            storage_gb: opts.storage_gb.unwrap_or(50),
            status: InstanceStatus::Pending,
            public_ip: None,
            private_ip: None,
            ssh_port: None,
            api_port: Some(8000),
            hourly_cost_usd: self.hourly(gpu_type) * gpu_count as f64,
            total_cost_usd: 0.0,
            docker_image: Some("gpuflow/sim:latest".to_string()),
            env: HashMap::new(),
            startup_script: None,
            region: opts.region.clone().or_else(|| Some("local".to_string())),
            preemptible: opts.use_spot,
            auto_terminate_minutes: None,
            provider_metadata: json!({ "idempotency_token": token }),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_heartbeat: None,
        })
    }

    async fn terminate_instance(&self, instance: &Instance) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if let Some(inst) = state.instances.get_mut(&instance.provider_instance_id) {
            inst.terminated = true;
        }
        // Terminating an unknown instance is a no-op success.
        Ok(true)
    }

    async fn probe_instance(&self, instance: &Instance) -> Result<InstanceProbe> {
        let state = self.state.lock().unwrap();
        let Some(inst) = state.instances.get(&instance.provider_instance_id) else {
            return Ok(InstanceProbe {
                status: InstanceStatus::Terminated,
                public_ip: None,
                api_port: None,
            });
        };

        let status = if inst.terminated {
            InstanceStatus::Terminated
        } else if inst.failed {
            InstanceStatus::Failed
        } else if state.stuck_in_starting || inst.created.elapsed() < inst.ready_after {
            InstanceStatus::Starting
        } else {
            InstanceStatus::Running
        };

        Ok(InstanceProbe {
            status,
            public_ip: (status == InstanceStatus::Running).then(|| "127.0.0.1".to_string()),
            api_port: Some(8000),
        })
    }

    fn latency_ms(&self) -> u64 {
        self.latency.get()
    }

    fn note_latency(&self, ms: u64) {
        self.latency.set(ms);
    }
}

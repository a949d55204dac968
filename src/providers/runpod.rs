// src/providers/runpod.rs
//
// =============================================================================
// GPUFLOW: RUNPOD ADAPTER
// =============================================================================
//
// The serverless GPU marketplace, spoken over GraphQL.
//
// Responsibilities:
// 1. Map canonical GPU types to RunPod display names and back.
// 2. Rent pods (interruptible with a bid, or on-demand).
// 3. Translate pod status + runtime ports into the canonical probe.
// 4. Respect the shared deadline/retry/rate-limit discipline.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::core::{
    GpuOffering, GpuType, Instance, InstanceStatus, Job, JobType, LaunchOptions, ProviderKind,
};
use crate::error::{OrchestratorError, Result};
use crate::providers::util::{with_retry, PriceCache, RateLimiter};
use crate::providers::{GpuProvider, InstanceProbe, LatencyGauge};

// ============================================================================
// 1. STATIC TABLES
// ============================================================================

/// Canonical type -> RunPod display name.
fn runpod_name(gpu: GpuType) -> &'static str {
    match gpu {
        GpuType::Rtx4090 => "NVIDIA GeForce RTX 4090",
        GpuType::Rtx3090 => "NVIDIA GeForce RTX 3090",
        GpuType::A100 => "NVIDIA A100-SXM4-80GB",
        GpuType::H100 => "NVIDIA H100-SXM5-80GB",
        GpuType::V100 => "Tesla V100-SXM2-32GB",
        GpuType::T4 => "Tesla T4",
    }
}

fn canonical_gpu(display_name: &str) -> Option<GpuType> {
    match display_name {
        "NVIDIA GeForce RTX 4090" => Some(GpuType::Rtx4090),
        "NVIDIA GeForce RTX 3090" => Some(GpuType::Rtx3090),
        "NVIDIA A100-SXM4-80GB" => Some(GpuType::A100),
        "NVIDIA H100-SXM5-80GB" => Some(GpuType::H100),
        "Tesla V100-SXM2-32GB" => Some(GpuType::V100),
        "Tesla T4" => Some(GpuType::T4),
        _ => None,
    }
}

/// On-demand $/GPU-hour. The live price list refines what users see; the
/// estimator stays on this table so estimates are stable and monotone.
fn base_hourly(gpu: GpuType) -> f64 {
    match gpu {
        GpuType::Rtx4090 => 0.50,
        GpuType::Rtx3090 => 0.40,
        GpuType::A100 => 2.50,
        GpuType::H100 => 4.00,
        GpuType::V100 => 1.50,
        GpuType::T4 => 0.30,
    }
}

fn memory_gb(gpu: GpuType) -> u32 {
    match gpu {
        GpuType::Rtx4090 | GpuType::Rtx3090 => 24,
        GpuType::A100 | GpuType::H100 => 80,
        GpuType::V100 => 32,
        GpuType::T4 => 16,
    }
}

fn vcpus(gpu: GpuType) -> u32 {
    match gpu {
        GpuType::Rtx4090 | GpuType::Rtx3090 => 8,
        GpuType::A100 | GpuType::H100 => 16,
        GpuType::V100 => 12,
        GpuType::T4 => 4,
    }
}

fn docker_image(job_type: JobType) -> &'static str {
    match job_type {
        JobType::LlavaInference => "runpod/llava:1.6-34b",
        JobType::LlamaInference => "runpod/llama:3.1-70b",
        JobType::Training => "runpod/pytorch:2.0-cuda11.8",
        JobType::Batch | JobType::Custom => "runpod/pytorch:2.0-cuda11.8",
    }
}

/// Spot bid at 80% of on-demand.
fn bid_per_gpu(gpu: GpuType) -> f64 {
    base_hourly(gpu) * 0.8
}

// ============================================================================
// 2. THE ADAPTER
// ============================================================================

pub struct RunPodProvider {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    limiter: RateLimiter,
    prices: PriceCache,
    latency: LatencyGauge,
}

impl RunPodProvider {
    pub fn new(api_url: String, api_key: String, rate_limit_per_sec: f64) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url,
            api_key,
            limiter: RateLimiter::new(rate_limit_per_sec, rate_limit_per_sec.max(1.0)),
            prices: PriceCache::new(Duration::from_secs(60)),
            latency: LatencyGauge::new(),
        }
    }

    /// One GraphQL round-trip. HTTP 4xx and GraphQL-level errors are
    /// permanent; everything else is transient and retried by the caller.
    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        self.limiter.acquire().await;
        let t0 = std::time::Instant::now();

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        self.latency.set(t0.elapsed().as_millis() as u64);

        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            let text = errors.to_string();
            // Capacity exhaustion is a retryable condition, not a bad request.
            if text.contains("no longer any instances") || text.contains("capacity") {
                return Err(OrchestratorError::InsufficientResources(text));
            }
            return Err(OrchestratorError::ProviderPermanent(format!(
                "runpod graphql: {text}"
            )));
        }

        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    fn pod_env(job: &Job, gpu_count: u32, opts: &LaunchOptions) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("JOB_ID".into(), job.id.to_string());
        env.insert("JOB_TYPE".into(), job.job_type.as_str().to_string());
        env.insert("MODEL_NAME".into(), job.model_name.clone());
        env.insert("GPU_COUNT".into(), gpu_count.to_string());
        if let Some(endpoint) = &opts.api_endpoint {
            env.insert("GPUFLOW_API_ENDPOINT".into(), endpoint.clone());
        }
        // Job-supplied environment rides along in the input bag.
        if let Some(extra) = job.input.get("environment").and_then(|v| v.as_object()) {
            for (k, v) in extra {
                if let Some(s) = v.as_str() {
                    env.insert(k.clone(), s.to_string());
                }
            }
        }
        env
    }
}

// ============================================================================
// 3. IMPLEMENTATION
// ============================================================================

const QUERY_GPU_TYPES: &str = "
query gpuTypes {
    gpuTypes {
        id
        displayName
        memoryInGb
        maxGpuCount
        lowestPrice { minimumBidPrice uninterruptablePrice }
        dataCenters { id name }
    }
}";

const MUTATION_RENT: &str = "
mutation rentPod($input: PodRentInterruptableInput!) {
    podRentInterruptable(input: $input) {
        id
        machineId
        machine { podHostId }
    }
}";

const MUTATION_TERMINATE: &str = "
mutation terminatePod($input: PodTerminateInput!) {
    podTerminate(input: $input) { id }
}";

const QUERY_POD: &str = "
query getPod($podId: String!) {
    pod(id: $podId) {
        id
        desiredStatus
        lastStatusChange
        runtime {
            uptimeInSeconds
            ports { ip isIpPublic privatePort publicPort type }
        }
    }
}";

#[async_trait]
impl GpuProvider for RunPodProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RunPod
    }

    async fn list_offerings(&self) -> Result<Arc<Vec<GpuOffering>>> {
        if let Some(cached) = self.prices.get() {
            return Ok(cached);
        }

        let data = with_retry("runpod list_offerings", || {
            self.graphql(QUERY_GPU_TYPES, json!({}))
        })
        .await?;

        let mut offerings = Vec::new();
        for gpu in data
            .get("gpuTypes")
            .and_then(|v| v.as_array())
            .unwrap_or(&Vec::new())
        {
            let Some(display) = gpu.get("displayName").and_then(|v| v.as_str()) else {
                continue;
            };
            // Hardware classes outside the canonical set are not rentable
            // through this orchestrator.
            let Some(gpu_type) = canonical_gpu(display) else {
                continue;
            };
            let price = &gpu["lowestPrice"];
            offerings.push(GpuOffering {
                gpu_type,
                memory_gb: gpu.get("memoryInGb").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                hourly_price_usd: price
                    .get("uninterruptablePrice")
                    .and_then(|v| v.as_f64())
                    .unwrap_or_else(|| base_hourly(gpu_type)),
                spot_price_usd: price.get("minimumBidPrice").and_then(|v| v.as_f64()),
                available_count: gpu.get("maxGpuCount").and_then(|v| v.as_u64()).unwrap_or(0)
                    as u32,
                regions: gpu
                    .get("dataCenters")
                    .and_then(|v| v.as_array())
                    .map(|dcs| {
                        dcs.iter()
                            .filter_map(|dc| dc.get("id").and_then(|v| v.as_str()))
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }

        let snapshot = Arc::new(offerings);
        self.prices.put(snapshot.clone());
        Ok(snapshot)
    }

    async fn estimate_cost(
        &self,
        gpu_type: GpuType,
        gpu_count: u32,
        runtime_minutes: u32,
    ) -> Result<f64> {
        let hourly = base_hourly(gpu_type) * gpu_count as f64;
        Ok(hourly * runtime_minutes as f64 / 60.0)
    }

    async fn create_instance(
        &self,
        job: &Job,
        gpu_type: GpuType,
        gpu_count: u32,
        opts: &LaunchOptions,
        token: &str,
    ) -> Result<Instance> {
        let env = Self::pod_env(job, gpu_count, opts);
        let name = format!("gpuflow-{}-{}", job.job_type.as_str(), &token[..12]);

        let mut input = json!({
            "name": name,
            "imageName": docker_image(job.job_type),
            "gpuTypeId": runpod_name(gpu_type),
            "gpuCount": gpu_count,
            "volumeInGb": opts.storage_gb.unwrap_or(50),
            "containerDiskInGb": opts.container_disk_gb.unwrap_or(20),
            "env": env.iter().map(|(k, v)| json!({"key": k, "value": v})).collect::<Vec<_>>(),
            "ports": "8000/http,22/tcp",
            "volumeMountPath": "/workspace",
        });
        if let Some(region) = &opts.region {
            input["dataCenterId"] = json!(region);
        }
        if opts.use_spot {
            input["bidPerGpu"] = json!(bid_per_gpu(gpu_type));
        }

        let data = with_retry("runpod create_instance", || {
            self.graphql(MUTATION_RENT, json!({ "input": input.clone() }))
        })
        .await?;

        let pod = &data["podRentInterruptable"];
        let pod_id = pod
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                OrchestratorError::Provider("runpod returned no pod id".to_string())
            })?
            .to_string();

        Ok(Instance {
            id: Uuid::new_v4(),
            provider: ProviderKind::RunPod,
            provider_instance_id: pod_id.clone(),
            gpu_type,
            gpu_count,
            memory_gb: memory_gb(gpu_type) * gpu_count,
            vcpus: vcpus(gpu_type) * gpu_count,
            storage_gb: opts.storage_gb.unwrap_or(50),
            status: InstanceStatus::Pending,
            public_ip: None,
            private_ip: None,
            ssh_port: Some(22),
            api_port: Some(8000),
            hourly_cost_usd: base_hourly(gpu_type) * gpu_count as f64,
            total_cost_usd: 0.0,
            docker_image: Some(docker_image(job.job_type).to_string()),
            env,
            startup_script: None,
            region: opts.region.clone(),
            preemptible: opts.use_spot,
            auto_terminate_minutes: None,
            provider_metadata: json!({
                "pod_id": pod_id,
                "machine_id": pod.get("machineId"),
                "bid_per_gpu": opts.use_spot.then(|| bid_per_gpu(gpu_type)),
                "idempotency_token": token,
            }),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_heartbeat: None,
        })
    }

    async fn terminate_instance(&self, instance: &Instance) -> Result<bool> {
        let pod_id = instance.provider_instance_id.clone();
        let result = with_retry("runpod terminate_instance", || {
            self.graphql(
                MUTATION_TERMINATE,
                json!({ "input": { "podId": pod_id.clone() } }),
            )
        })
        .await;

        match result {
            Ok(_) => Ok(true),
            // A pod the API no longer knows is already terminated.
            Err(OrchestratorError::ProviderPermanent(msg)) if msg.contains("not found") => {
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn probe_instance(&self, instance: &Instance) -> Result<InstanceProbe> {
        let pod_id = instance.provider_instance_id.clone();
        let data = with_retry("runpod probe_instance", || {
            self.graphql(QUERY_POD, json!({ "podId": pod_id.clone() }))
        })
        .await?;

        let pod = &data["pod"];
        if pod.is_null() {
            return Ok(InstanceProbe {
                status: InstanceStatus::Terminated,
                public_ip: None,
                api_port: None,
            });
        }

        let status = match pod.get("desiredStatus").and_then(|v| v.as_str()) {
            Some("PENDING") => InstanceStatus::Pending,
            Some("STARTING") | Some("CREATED") => InstanceStatus::Starting,
            Some("RUNNING") => InstanceStatus::Running,
            Some("STOPPING") => InstanceStatus::Stopping,
            Some("STOPPED") => InstanceStatus::Stopped,
            Some("EXITED") | Some("TERMINATED") => InstanceStatus::Terminated,
            // FAILED and anything unrecognised map to the failure state.
            _ => InstanceStatus::Failed,
        };

        // Endpoint discovery: the public mapping of the workload port shows
        // up in runtime.ports once the container is live.
        let mut public_ip = None;
        let mut api_port = None;
        if let Some(ports) = pod
            .get("runtime")
            .and_then(|r| r.get("ports"))
            .and_then(|p| p.as_array())
        {
            for port in ports {
                let is_public = port.get("isIpPublic").and_then(|v| v.as_bool()).unwrap_or(false);
                let private = port.get("privatePort").and_then(|v| v.as_u64());
                if is_public && private == Some(8000) {
                    public_ip = port
                        .get("ip")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                    api_port = port.get("publicPort").and_then(|v| v.as_u64()).map(|p| p as u16);
                }
            }
        }

        Ok(InstanceProbe {
            status,
            public_ip,
            api_port,
        })
    }

    fn latency_ms(&self) -> u64 {
        self.latency.get()
    }

    fn note_latency(&self, ms: u64) {
        self.latency.set(ms);
    }
}

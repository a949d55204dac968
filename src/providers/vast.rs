// src/providers/vast.rs
//
// =============================================================================
// GPUFLOW: VAST.AI ADAPTER
// =============================================================================
//
// The spot marketplace, spoken over plain REST.
//
// Responsibilities:
// 1. Search rentable offers and fold them into the canonical price list.
// 2. Rent an ask, tagging it with the idempotency token as its label.
// 3. Map Vast's actual_status strings into the canonical set.

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

fn vast_gpu_name(gpu: GpuType) -> &'static str {
    match gpu {
        GpuType::Rtx4090 => "RTX 4090",
        GpuType::Rtx3090 => "RTX 3090",
        GpuType::A100 => "A100 SXM4",
        GpuType::H100 => "H100 SXM",
        GpuType::V100 => "Tesla V100",
        GpuType::T4 => "Tesla T4",
    }
}

fn canonical_gpu(name: &str) -> Option<GpuType> {
    match name {
        "RTX 4090" => Some(GpuType::Rtx4090),
        "RTX 3090" => Some(GpuType::Rtx3090),
        "A100 SXM4" | "A100 PCIE" => Some(GpuType::A100),
        "H100 SXM" | "H100 PCIE" => Some(GpuType::H100),
        "Tesla V100" => Some(GpuType::V100),
        "Tesla T4" => Some(GpuType::T4),
        _ => None,
    }
}

/// Marketplace floor $/GPU-hour used by the estimator. Vast trades below
/// the hyperscaler rates for the same silicon.
fn base_hourly(gpu: GpuType) -> f64 {
    match gpu {
        GpuType::Rtx4090 => 0.45,
        GpuType::Rtx3090 => 0.30,
        GpuType::A100 => 1.90,
        GpuType::H100 => 3.20,
        GpuType::V100 => 0.90,
        GpuType::T4 => 0.20,
    }
}

fn docker_image(job_type: JobType) -> &'static str {
    match job_type {
        JobType::LlavaInference => "vastai/llava:latest",
        JobType::LlamaInference => "vastai/llama:latest",
        JobType::Training | JobType::Batch | JobType::Custom => "vastai/pytorch:latest",
    }
}

// ============================================================================
// 2. THE ADAPTER
// ============================================================================

pub struct VastProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: RateLimiter,
    prices: PriceCache,
    latency: LatencyGauge,
}

impl VastProvider {
    pub fn new(base_url: String, api_key: String, rate_limit_per_sec: f64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            limiter: RateLimiter::new(rate_limit_per_sec, rate_limit_per_sec.max(1.0)),
            prices: PriceCache::new(Duration::from_secs(60)),
            latency: LatencyGauge::new(),
        }
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        self.limiter.acquire().await;
        let t0 = std::time::Instant::now();

        let mut req = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let response = req.send().await?.error_for_status()?;
        let parsed: Value = response.json().await?;
        self.latency.set(t0.elapsed().as_millis() as u64);

        if parsed.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let msg = parsed
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified")
                .to_string();
            if msg.contains("no_such_ask") || msg.contains("unavailable") {
                return Err(OrchestratorError::InsufficientResources(msg));
            }
            return Err(OrchestratorError::ProviderPermanent(format!("vast: {msg}")));
        }
        Ok(parsed)
    }

    /// The cheapest currently-rentable ask for a hardware class.
    async fn find_ask(&self, gpu_type: GpuType, gpu_count: u32) -> Result<Value> {
        let query = json!({
            "gpu_name": { "eq": vast_gpu_name(gpu_type) },
            "num_gpus": { "gte": gpu_count },
            "rentable": { "eq": true },
            "order": [["dph_total", "asc"]],
            "type": "on-demand",
        });
        let body = self
            .request(
                reqwest::Method::GET,
                &format!("/bundles/?q={}", urlencode(&query.to_string())),
                None,
            )
            .await?;

        body.get("offers")
            .and_then(|v| v.as_array())
            .and_then(|offers| offers.first().cloned())
            .ok_or_else(|| {
                OrchestratorError::InsufficientResources(format!(
                    "no rentable {gpu_type} x{gpu_count} offers"
                ))
            })
    }
}

/// Minimal percent-encoding for the search query parameter.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ============================================================================
// 3. IMPLEMENTATION
// ============================================================================

#[async_trait]
impl GpuProvider for VastProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vast
    }

    async fn list_offerings(&self) -> Result<Arc<Vec<GpuOffering>>> {
        if let Some(cached) = self.prices.get() {
            return Ok(cached);
        }

        let query = json!({
            "rentable": { "eq": true },
            "order": [["dph_total", "asc"]],
            "type": "on-demand",
        });
        let path = format!("/bundles/?q={}", urlencode(&query.to_string()));
        let body = with_retry("vast list_offerings", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await?;

        // Collapse per-machine offers into one row per hardware class.
        let mut by_gpu: HashMap<GpuType, GpuOffering> = HashMap::new();
        for offer in body
            .get("offers")
            .and_then(|v| v.as_array())
            .unwrap_or(&Vec::new())
        {
            let Some(gpu_type) = offer
                .get("gpu_name")
                .and_then(|v| v.as_str())
                .and_then(canonical_gpu)
            else {
                continue;
            };
            let num = offer.get("num_gpus").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let dph = offer.get("dph_total").and_then(|v| v.as_f64()).unwrap_or(f64::MAX);
            let bid = offer.get("min_bid").and_then(|v| v.as_f64());
            let geo = offer
                .get("geolocation")
                .and_then(|v| v.as_str())
                .map(String::from);

            let entry = by_gpu.entry(gpu_type).or_insert_with(|| GpuOffering {
                gpu_type,
                memory_gb: offer
                    .get("gpu_ram")
                    .and_then(|v| v.as_f64())
                    .map(|mb| (mb / 1024.0).round() as u32)
                    .unwrap_or(0),
                hourly_price_usd: dph,
                spot_price_usd: bid,
                available_count: 0,
                regions: Vec::new(),
            });
            entry.available_count += num;
            if dph < entry.hourly_price_usd {
                entry.hourly_price_usd = dph;
            }
            if let Some(g) = geo {
                if !entry.regions.contains(&g) {
                    entry.regions.push(g);
                }
            }
        }

        let snapshot = Arc::new(by_gpu.into_values().collect::<Vec<_>>());
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
        // Idempotency: an earlier attempt may have rented already. The
        // label carries our token, so look before renting again.
        let existing = with_retry("vast find_existing", || {
            self.request(reqwest::Method::GET, "/instances/", None)
        })
        .await?;
        let prior = existing
            .get("instances")
            .and_then(|v| v.as_array())
            .and_then(|list| {
                list.iter()
                    .find(|i| i.get("label").and_then(|l| l.as_str()) == Some(token))
                    .cloned()
            });

        let (contract_id, hourly) = match prior {
            Some(inst) => {
                let id = inst.get("id").and_then(|v| v.as_u64()).ok_or_else(|| {
                    OrchestratorError::Provider("vast instance without id".into())
                })?;
                let dph = inst
                    .get("dph_total")
                    .and_then(|v| v.as_f64())
                    .unwrap_or_else(|| base_hourly(gpu_type) * gpu_count as f64);
                log::info!("vast: reusing rental {id} for token {token}");
                (id, dph)
            }
            None => {
                let ask = self.find_ask(gpu_type, gpu_count).await?;
                let ask_id = ask.get("id").and_then(|v| v.as_u64()).ok_or_else(|| {
                    OrchestratorError::Provider("vast ask without id".into())
                })?;
                let dph = ask
                    .get("dph_total")
                    .and_then(|v| v.as_f64())
                    .unwrap_or_else(|| base_hourly(gpu_type) * gpu_count as f64);

                let rent_body = json!({
                    "client_id": "me",
                    "image": docker_image(job.job_type),
                    "label": token,
                    "disk": opts.storage_gb.unwrap_or(50),
                    "env": {
                        "JOB_ID": job.id.to_string(),
                        "JOB_TYPE": job.job_type.as_str(),
                        "MODEL_NAME": job.model_name.clone(),
                        "GPU_COUNT": gpu_count.to_string(),
                    },
                    "onstart": null,
                    "runtype": "args",
                });
                let path = format!("/asks/{ask_id}/");
                let created = with_retry("vast create_instance", || {
                    self.request(reqwest::Method::PUT, &path, Some(rent_body.clone()))
                })
                .await?;

                let contract = created
                    .get("new_contract")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        OrchestratorError::Provider("vast rent returned no contract".into())
                    })?;
                (contract, dph)
            }
        };

        Ok(Instance {
            id: Uuid::new_v4(),
            provider: ProviderKind::Vast,
            provider_instance_id: contract_id.to_string(),
            gpu_type,
            gpu_count,
            memory_gb: 0,
            vcpus: 0,
            storage_gb: opts.storage_gb.unwrap_or(50),
            status: InstanceStatus::Pending,
            public_ip: None,
            private_ip: None,
            ssh_port: None,
            api_port: Some(8000),
            hourly_cost_usd: hourly,
            total_cost_usd: 0.0,
            docker_image: Some(docker_image(job.job_type).to_string()),
            env: HashMap::new(),
            startup_script: None,
            region: opts.region.clone(),
            preemptible: opts.use_spot,
            auto_terminate_minutes: None,
            provider_metadata: json!({
                "contract_id": contract_id,
                "idempotency_token": token,
            }),
            created_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            last_heartbeat: None,
        })
    }

    async fn terminate_instance(&self, instance: &Instance) -> Result<bool> {
        let path = format!("/instances/{}/", instance.provider_instance_id);
        let result = with_retry("vast terminate_instance", || {
            self.request(reqwest::Method::DELETE, &path, None)
        })
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(OrchestratorError::ProviderPermanent(msg)) if msg.contains("no such") => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn probe_instance(&self, instance: &Instance) -> Result<InstanceProbe> {
        let path = format!("/instances/{}/", instance.provider_instance_id);
        let body = with_retry("vast probe_instance", || {
            self.request(reqwest::Method::GET, &path, None)
        })
        .await;

        let body = match body {
            Ok(b) => b,
            Err(OrchestratorError::ProviderPermanent(msg)) if msg.contains("no such") => {
                return Ok(InstanceProbe {
                    status: InstanceStatus::Terminated,
                    public_ip: None,
                    api_port: None,
                });
            }
            Err(e) => return Err(e),
        };

        let inst = body.get("instances").unwrap_or(&body);
        let status = match inst.get("actual_status").and_then(|v| v.as_str()) {
            Some("created") => InstanceStatus::Pending,
            Some("loading") => InstanceStatus::Starting,
            Some("running") => InstanceStatus::Running,
            Some("stopping") => InstanceStatus::Stopping,
            Some("stopped") | Some("offline") => InstanceStatus::Stopped,
            Some("exited") | Some("destroyed") => InstanceStatus::Terminated,
            _ => InstanceStatus::Failed,
        };

        Ok(InstanceProbe {
            status,
            public_ip: inst
                .get("public_ipaddr")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
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

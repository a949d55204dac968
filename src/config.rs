// src/config.rs
//
// =============================================================================
// GPUFLOW: SETTINGS
// =============================================================================
//
// Environment-driven configuration, parsed once at startup and carried
// through the context object. Every knob has a production default; the
// timing knobs exist so the test-suite can run lifecycles in milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::GpuType;
use crate::placement::Strategy;

#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path.
    pub database_path: PathBuf,

    // Scheduling
    pub max_concurrent_jobs: usize,
    pub job_timeout_hours: u64,
    pub scheduler_interval: Duration,
    pub cleanup_interval: Duration,
    /// Queued jobs older than this window get a priority bump per window.
    pub priority_boost_window: Duration,
    /// Consecutive dispatches one user may receive before the loop moves on.
    pub fairness_window: u32,

    // Instance lifecycle
    pub instance_poll_interval: Duration,
    pub readiness_timeout: Duration,

    // Cost policy
    pub cost_optimization_enabled: bool,
    pub max_hourly_cost_usd: f64,
    pub default_gpu_type: GpuType,

    // Provider credentials / endpoints
    pub runpod_api_key: Option<String>,
    pub runpod_api_url: String,
    pub vast_api_key: Option<String>,
    pub vast_api_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_path: env_str("GPUFLOW_DB", "gpuflow.db").into(),

            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 20),
            job_timeout_hours: env_parse("JOB_TIMEOUT_HOURS", 24),
            scheduler_interval: Duration::from_secs(env_parse("SCHEDULER_INTERVAL_SECS", 30)),
            cleanup_interval: Duration::from_secs(env_parse("CLEANUP_INTERVAL_SECS", 300)),
            priority_boost_window: Duration::from_secs(
                env_parse("PRIORITY_BOOST_HOURS", 24u64) * 3600,
            ),
            fairness_window: env_parse("FAIRNESS_WINDOW", 3),

            instance_poll_interval: Duration::from_secs(env_parse("INSTANCE_POLL_SECS", 30)),
            readiness_timeout: Duration::from_secs(env_parse("READINESS_TIMEOUT_SECS", 600)),

            cost_optimization_enabled: env_bool("COST_OPTIMIZATION_ENABLED", true),
            max_hourly_cost_usd: env_parse("MAX_HOURLY_COST_USD", 50.0),
            default_gpu_type: std::env::var("DEFAULT_GPU_TYPE")
                .ok()
                .and_then(|s| GpuType::parse(&s).ok())
                .unwrap_or(GpuType::Rtx4090),

            runpod_api_key: std::env::var("RUNPOD_API_KEY").ok().filter(|s| !s.is_empty()),
            runpod_api_url: env_str("RUNPOD_API_URL", "https://api.runpod.io/graphql"),
            vast_api_key: std::env::var("VAST_API_KEY").ok().filter(|s| !s.is_empty()),
            vast_api_url: env_str("VAST_API_URL", "https://console.vast.ai/api/v0"),
        }
    }

    /// Placement strategy derived from the cost-policy switch.
    pub fn strategy(&self) -> Strategy {
        if self.cost_optimization_enabled {
            Strategy::CostOptimized
        } else {
            Strategy::Balanced
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Defaults without touching the environment; tests build on this.
        Self {
            database_path: "gpuflow.db".into(),
            max_concurrent_jobs: 20,
            job_timeout_hours: 24,
            scheduler_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            priority_boost_window: Duration::from_secs(24 * 3600),
            fairness_window: 3,
            instance_poll_interval: Duration::from_secs(30),
            readiness_timeout: Duration::from_secs(600),
            cost_optimization_enabled: true,
            max_hourly_cost_usd: 50.0,
            default_gpu_type: GpuType::Rtx4090,
            runpod_api_key: None,
            runpod_api_url: "https://api.runpod.io/graphql".into(),
            vast_api_key: None,
            vast_api_url: "https://console.vast.ai/api/v0".into(),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"),
        Err(_) => default,
    }
}

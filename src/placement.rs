// src/placement.rs
//
// =============================================================================
// GPUFLOW: PLACEMENT PLANNER
// =============================================================================
//
// Given a job and the live adapters, decide where it runs.
//
// The funnel:
// 1. Every enabled adapter gets to validate the requirements; failures drop.
// 2. Survivors are costed.
// 3. The budget guard cuts anything over 1.5x the admitted estimate.
// 4. The strategy picks the winner; provider priority breaks ties.
//
// No retries here. A job that cannot be placed fails with NO_PLACEMENT and
// the runner decides what that means.

use serde::{Deserialize, Serialize};

use crate::core::{Job, Placement, ProviderKind};
use crate::error::Result;
use crate::providers::{ProviderRegistry, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    CostOptimized,
    PerformanceOptimized,
    Balanced,
    FastestAvailable,
}

/// One provider that survived validation.
struct Candidate {
    provider: ProviderKind,
    cost: f64,
    latency_ms: u64,
    priority: u8,
    region: Option<String>,
    available: u32,
}

pub struct PlacementPlanner {
    strategy: Strategy,
    /// Global ceiling on the hourly burn rate of any single placement.
    max_hourly_cost_usd: f64,
}

impl PlacementPlanner {
    pub fn new(strategy: Strategy, max_hourly_cost_usd: f64) -> Self {
        Self {
            strategy,
            max_hourly_cost_usd,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Select `(provider, gpu_type, gpu_count, region)` for the job, or
    /// None when no adapter qualifies. `allow` carries caller-side policy
    /// (the user's allowed-provider list, per-provider instance caps).
    pub async fn plan<F>(
        &self,
        registry: &ProviderRegistry,
        job: &Job,
        allow: F,
    ) -> Result<Option<Placement>>
    where
        F: Fn(ProviderKind) -> bool,
    {
        let mut candidates = Vec::new();

        for entry in registry.enabled() {
            if !allow(entry.settings.provider) {
                continue;
            }
            let adapter = &entry.adapter;

            let verdict = match adapter
                .validate_requirements(job, job.gpu_type, job.gpu_count)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    // An unreachable provider is just not a candidate today.
                    log::warn!("placement: {} validation errored: {e}", entry.settings.provider);
                    continue;
                }
            };
            match verdict {
                Verdict::Eligible => {}
                Verdict::Rejected(reason) => {
                    log::debug!("placement: {} rejected: {reason}", entry.settings.provider);
                    continue;
                }
            }

            let cost = match adapter
                .estimate_cost(job.gpu_type, job.gpu_count, job.max_runtime_minutes)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("placement: {} estimate errored: {e}", entry.settings.provider);
                    continue;
                }
            };

            // Budget guard: never place at more than 1.5x what admission
            // promised the user.
            if job.estimated_cost_usd > 0.0 && cost > job.estimated_cost_usd * 1.5 {
                log::debug!(
                    "placement: {} over budget (${cost:.2} > 1.5 x ${:.2})",
                    entry.settings.provider,
                    job.estimated_cost_usd
                );
                continue;
            }

            // Hourly burn-rate ceilings: the orchestrator-wide cap and the
            // per-provider operator cap.
            let hourly = cost * 60.0 / job.max_runtime_minutes.max(1) as f64;
            if hourly > self.max_hourly_cost_usd || hourly > entry.settings.max_hourly_cost_usd {
                log::debug!(
                    "placement: {} hourly ${hourly:.2} over cap",
                    entry.settings.provider
                );
                continue;
            }

            let availability = adapter
                .list_offerings()
                .await
                .ok()
                .and_then(|offers| {
                    offers
                        .iter()
                        .find(|o| o.gpu_type == job.gpu_type)
                        .map(|o| o.available_count)
                })
                .unwrap_or(0);

            candidates.push(Candidate {
                provider: entry.settings.provider,
                cost,
                latency_ms: adapter.latency_ms(),
                priority: entry.settings.priority,
                region: entry.settings.default_region.clone(),
                available: availability,
            });
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let winner = match self.strategy {
            Strategy::CostOptimized => candidates
                .into_iter()
                .min_by(|a, b| {
                    a.cost
                        .total_cmp(&b.cost)
                        .then(a.priority.cmp(&b.priority))
                })
                .unwrap(),
            Strategy::PerformanceOptimized => candidates
                .into_iter()
                .min_by(|a, b| {
                    a.latency_ms
                        .cmp(&b.latency_ms)
                        .then(a.cost.total_cmp(&b.cost))
                })
                .unwrap(),
            Strategy::Balanced => candidates
                .into_iter()
                .min_by(|a, b| {
                    balanced_score(a)
                        .total_cmp(&balanced_score(b))
                        .then(a.priority.cmp(&b.priority))
                })
                .unwrap(),
            Strategy::FastestAvailable => {
                // Registry order is priority order; first with stock wins.
                let mut sorted = candidates;
                sorted.sort_by_key(|c| c.priority);
                match sorted.into_iter().find(|c| c.available > 0) {
                    Some(c) => c,
                    None => return Ok(None),
                }
            }
        };

        log::info!(
            "placement: job {} -> {} (${:.2} est, {}ms)",
            job.id,
            winner.provider,
            winner.cost,
            winner.latency_ms
        );

        Ok(Some(Placement {
            provider: winner.provider,
            gpu_type: job.gpu_type,
            gpu_count: job.gpu_count,
            region: winner.region,
            estimated_cost_usd: winner.cost,
        }))
    }
}

/// Cost inflated by a latency penalty capped at 50%: one full second of
/// API latency counts as half the price again.
fn balanced_score(c: &Candidate) -> f64 {
    let penalty = (c.latency_ms as f64 / 2000.0).min(0.5);
    c.cost * (1.0 + penalty)
}

// tests/placement_tests.rs
//
// Placement planner behaviour: strategy selection, the budget guard, and
// estimator laws. Two simulated "clouds" compete for every job.

mod common;

use chrono::Utc;
use common::make_job;
use std::sync::Arc;
use uuid::Uuid;

use gpuflow::core::{GpuType, ProviderKind, ProviderSettings};
use gpuflow::placement::{PlacementPlanner, Strategy};
use gpuflow::providers::local::LocalProvider;
use gpuflow::providers::{GpuProvider, ProviderRegistry};

struct Market {
    registry: ProviderRegistry,
    runpod: Arc<LocalProvider>,
    vast: Arc<LocalProvider>,
}

/// Two scripted providers masquerading as RunPod (priority 1) and Vast
/// (priority 2).
fn market() -> Market {
    let runpod = Arc::new(LocalProvider::masquerading(ProviderKind::RunPod));
    let vast = Arc::new(LocalProvider::masquerading(ProviderKind::Vast));

    let mut rp_settings = ProviderSettings::defaults(ProviderKind::RunPod, "sim://runpod".into());
    rp_settings.priority = 1;
    let mut vast_settings = ProviderSettings::defaults(ProviderKind::Vast, "sim://vast".into());
    vast_settings.priority = 2;

    let mut registry = ProviderRegistry::new();
    registry.register(runpod.clone(), rp_settings);
    registry.register(vast.clone(), vast_settings);

    Market {
        registry,
        runpod,
        vast,
    }
}

#[tokio::test]
async fn cost_optimized_picks_the_cheaper_provider() {
    let m = market();
    // P1 offers A100 @ $2.89/h, P2 @ $2.49/h.
    m.runpod.set_price(GpuType::A100, 2.89);
    m.vast.set_price(GpuType::A100, 2.49);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::A100;
    job.gpu_count = 2;
    job.max_runtime_minutes = 60;
    job.estimated_cost_usd = 4.98;

    let planner = PlacementPlanner::new(Strategy::CostOptimized, 50.0);
    let placement = planner
        .plan(&m.registry, &job, |_| true)
        .await
        .unwrap()
        .expect("a placement");

    assert_eq!(placement.provider, ProviderKind::Vast);
    assert!(
        (placement.estimated_cost_usd - 4.98).abs() < 1e-9,
        "2 GPUs x $2.49 x 1h = $4.98, got {}",
        placement.estimated_cost_usd
    );
}

#[tokio::test]
async fn equal_cost_ties_break_on_provider_priority() {
    let m = market();
    m.runpod.set_price(GpuType::A100, 2.50);
    m.vast.set_price(GpuType::A100, 2.50);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::A100;
    job.estimated_cost_usd = 2.50;

    let planner = PlacementPlanner::new(Strategy::CostOptimized, 50.0);
    let placement = planner
        .plan(&m.registry, &job, |_| true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(placement.provider, ProviderKind::RunPod, "priority 1 wins the tie");
}

#[tokio::test]
async fn budget_guard_drops_everything_too_expensive() {
    let m = market();
    m.runpod.set_price(GpuType::A100, 9.0);
    m.vast.set_price(GpuType::A100, 9.0);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::A100;
    job.max_runtime_minutes = 60;
    // Admitted at $2: a $9 placement is far beyond the 1.5x allowance.
    job.estimated_cost_usd = 2.0;

    let planner = PlacementPlanner::new(Strategy::CostOptimized, 50.0);
    let placement = planner.plan(&m.registry, &job, |_| true).await.unwrap();
    assert!(placement.is_none(), "both providers breach the budget guard");
}

#[tokio::test]
async fn performance_strategy_prefers_the_lower_latency_provider() {
    let m = market();
    m.runpod.set_price(GpuType::A100, 2.0);
    m.vast.set_price(GpuType::A100, 3.0);
    m.runpod.set_latency_ms(450);
    m.vast.set_latency_ms(80);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::A100;
    job.estimated_cost_usd = 3.0;

    let planner = PlacementPlanner::new(Strategy::PerformanceOptimized, 50.0);
    let placement = planner
        .plan(&m.registry, &job, |_| true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        placement.provider,
        ProviderKind::Vast,
        "lower latency beats lower cost under PERFORMANCE_OPTIMIZED"
    );
}

#[tokio::test]
async fn fastest_available_skips_empty_providers() {
    let m = market();
    // Priority-1 provider has no A100 stock at all.
    m.runpod.set_availability(GpuType::A100, 0);
    m.vast.set_availability(GpuType::A100, 4);
    m.runpod.set_price(GpuType::A100, 1.0);
    m.vast.set_price(GpuType::A100, 1.0);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::A100;
    job.estimated_cost_usd = 1.0;

    let planner = PlacementPlanner::new(Strategy::FastestAvailable, 50.0);
    let placement = planner
        .plan(&m.registry, &job, |_| true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(placement.provider, ProviderKind::Vast);
}

#[tokio::test]
async fn unsupported_requirements_yield_no_placement() {
    let m = market();
    m.runpod.set_availability(GpuType::H100, 0);
    m.vast.set_availability(GpuType::H100, 0);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::H100;
    job.gpu_count = 8;
    job.estimated_cost_usd = 100.0;

    let planner = PlacementPlanner::new(Strategy::CostOptimized, 50.0);
    let placement = planner.plan(&m.registry, &job, |_| true).await.unwrap();
    assert!(placement.is_none());
}

#[tokio::test]
async fn caller_filter_excludes_providers() {
    let m = market();
    m.runpod.set_price(GpuType::A100, 1.0);
    m.vast.set_price(GpuType::A100, 5.0);

    let mut job = make_job(Uuid::new_v4(), 5, Utc::now());
    job.gpu_type = GpuType::A100;
    job.estimated_cost_usd = 5.0;

    // The cheaper provider is not allowed for this user.
    let planner = PlacementPlanner::new(Strategy::CostOptimized, 50.0);
    let placement = planner
        .plan(&m.registry, &job, |p| p != ProviderKind::RunPod)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(placement.provider, ProviderKind::Vast);
}

#[tokio::test]
async fn cost_estimates_are_monotone() {
    let provider = LocalProvider::new();

    let base = provider.estimate_cost(GpuType::A100, 1, 60).await.unwrap();
    let more_gpus = provider.estimate_cost(GpuType::A100, 2, 60).await.unwrap();
    let more_gpus_still = provider.estimate_cost(GpuType::A100, 4, 60).await.unwrap();
    assert!(base < more_gpus && more_gpus < more_gpus_still);

    let short = provider.estimate_cost(GpuType::A100, 1, 30).await.unwrap();
    let long = provider.estimate_cost(GpuType::A100, 1, 120).await.unwrap();
    assert!(short < base && base < long);
}

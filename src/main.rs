// src/main.rs
//
// =============================================================================
// GPUFLOW: ENTRY POINT
// =============================================================================
//
// The command surface of the orchestrator node.
//
// Modes:
// 1. START:  Boots the scheduler + cleanup loops against the configured
//            providers (or the local simulator) and serves until ctrl-c.
// 2. SUBMIT: Admits one job described by a JSON file into the shared
//            database; the running service picks it up on its next tick.
// 3. STATUS: Prints queue counts and metrics.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use uuid::Uuid;

use gpuflow::core::{Principal, SubmitRequest};
use gpuflow::{Orchestrator, Settings};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "gpuflow", version, about = "Multi-tenant GPU job orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator node (scheduler + cleanup + monitors).
    Start {
        /// Database path. Overrides GPUFLOW_DB.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Use the in-process simulated provider instead of real clouds.
        #[arg(long)]
        local: bool,
    },

    /// Submit a job from a JSON request file.
    Submit {
        /// Path to the SubmitRequest JSON.
        #[arg(long)]
        file: PathBuf,

        /// Acting user id (normally extracted from the bearer token by
        /// the API gateway in front of this service).
        #[arg(long)]
        user: Uuid,

        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Show queue counts and metrics.
    Status {
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { db, local } => run_service(db, local).await,
        Commands::Submit { file, user, db } => run_submit(file, user, db).await,
        Commands::Status { db } => run_status(db),
    }
}

fn settings_with_db(db: Option<PathBuf>) -> Settings {
    let mut settings = Settings::from_env();
    if let Some(path) = db {
        settings.database_path = path;
    }
    settings
}

// ============================================================================
// 3. RUNTIME: THE NODE SERVICE
// ============================================================================

async fn run_service(db: Option<PathBuf>, local: bool) -> Result<()> {
    let settings = settings_with_db(db);
    log::info!(
        "booting gpuflow: db={:?} cap={} strategy={:?}{}",
        settings.database_path,
        settings.max_concurrent_jobs,
        settings.strategy(),
        if local { " [local simulator]" } else { "" }
    );

    let orchestrator = Orchestrator::bootstrap(settings, local).context("bootstrap")?;
    orchestrator.start();

    signal::ctrl_c().await.ok();
    log::warn!("interrupt received, stopping");
    orchestrator.shutdown();

    // Give runners a moment to write their terminal states.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    log::info!("node shutdown complete");
    Ok(())
}

// ============================================================================
// 4. ONE-SHOT COMMANDS
// ============================================================================

async fn run_submit(file: PathBuf, user: Uuid, db: Option<PathBuf>) -> Result<()> {
    let settings = settings_with_db(db);
    let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let request: SubmitRequest = serde_json::from_str(&raw).context("parsing request")?;

    // Admission only; the long-running service dispatches it.
    let orchestrator = Orchestrator::bootstrap(settings, false).context("bootstrap")?;
    let ticket = orchestrator
        .submit_job(Principal { user_id: user }, request)
        .await
        .map_err(|e| anyhow!("submission rejected [{}]: {e}", e.class()))?;

    println!(
        "job {} {} (estimated ${:.2})",
        ticket.job_id,
        ticket.status,
        ticket.estimated_cost_usd
    );
    Ok(())
}

fn run_status(db: Option<PathBuf>) -> Result<()> {
    let settings = settings_with_db(db);
    let store = gpuflow::JobStore::open(&settings.database_path).context("open db")?;

    let counts = store.status_counts().map_err(|e| anyhow!("{e}"))?;
    let metrics = store.queue_metrics().map_err(|e| anyhow!("{e}"))?;

    println!("queue status:");
    for (status, count) in &counts {
        println!("  {status:>10}: {count}");
    }
    println!(
        "metrics: avg wait {:.1} min | avg exec {:.1} min | total spend ${:.2}",
        metrics.average_wait_minutes,
        metrics.average_execution_minutes,
        metrics.total_cost_usd
    );
    Ok(())
}

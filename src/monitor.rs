// src/monitor.rs
//
// =============================================================================
// GPUFLOW: INSTANCE MONITOR
// =============================================================================
//
// One cooperative task per rented box, alive until the box reaches a
// terminal state.
//
// Responsibilities:
// 1. Poll the provider on a fixed cadence and persist every change.
// 2. Stamp started_at / stopped_at and discover the public endpoint.
// 3. Accrue cost while the box runs (monotone, settled at teardown).
// 4. Downgrade to FAILED when the provider goes silent (stale heartbeat).
// 5. Broadcast transitions over a watch channel the Job Runner awaits.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::core::InstanceStatus;
use crate::providers::GpuProvider;
use crate::store::JobStore;

pub struct InstanceMonitor;

impl InstanceMonitor {
    /// Spawn the poll loop. The receiver yields every observed status;
    /// RUNNING is only reported once the box has a reachable endpoint.
    pub fn spawn(
        store: Arc<JobStore>,
        adapter: Arc<dyn GpuProvider>,
        instance_id: Uuid,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> watch::Receiver<InstanceStatus> {
        let (tx, rx) = watch::channel(InstanceStatus::Pending);

        tokio::spawn(async move {
            let mut last_contact = Instant::now();

            loop {
                let mut instance = match store.get_instance(instance_id) {
                    Ok(Some(i)) => i,
                    Ok(None) => {
                        log::warn!("monitor: instance {instance_id} vanished from store");
                        return;
                    }
                    Err(e) => {
                        log::error!("monitor: store read for {instance_id} failed: {e}");
                        return;
                    }
                };
                if instance.status.is_terminal() {
                    let _ = tx.send(instance.status);
                    return;
                }

                match adapter.probe_instance(&instance).await {
                    Ok(probe) => {
                        last_contact = Instant::now();
                        let now = Utc::now();

                        // Readiness is RUNNING plus a reachable endpoint; a
                        // port that has not surfaced yet is still startup.
                        let mut status = probe.status;
                        if status == InstanceStatus::Running && probe.public_ip.is_none() {
                            status = InstanceStatus::Starting;
                        }

                        if probe.public_ip.is_some() {
                            instance.public_ip = probe.public_ip;
                        }
                        if probe.api_port.is_some() {
                            instance.api_port = probe.api_port;
                        }
                        instance.last_heartbeat = Some(now);

                        let changed = status != instance.status;
                        if changed {
                            log::info!(
                                "instance {} ({}): {} -> {}",
                                instance.id,
                                instance.provider,
                                instance.status,
                                status
                            );
                        }
                        instance.status = status;

                        if status == InstanceStatus::Running && instance.started_at.is_none() {
                            instance.started_at = Some(now);
                        }
                        if status.is_terminal() && instance.stopped_at.is_none() {
                            instance.stopped_at = Some(now);
                        }

                        // Cost accrual: billed from first RUNNING until stop.
                        if let Some(started) = instance.started_at {
                            let end = instance.stopped_at.unwrap_or(now);
                            let hours =
                                ((end - started).num_milliseconds().max(0) as f64) / 3_600_000.0;
                            let accrued = instance.hourly_cost_usd * hours;
                            if accrued > instance.total_cost_usd {
                                instance.total_cost_usd = accrued;
                            }
                        }

                        if let Err(e) = store.update_instance(&instance) {
                            log::error!("monitor: persist for {} failed: {e}", instance.id);
                        }
                        if changed {
                            let _ = tx.send(status);
                        }
                        if status.is_terminal() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::warn!("monitor: probe for {} failed: {e}", instance.id);

                        // Stale heartbeat: the provider has gone silent
                        // beyond twice the poll cadence.
                        if last_contact.elapsed() > poll_interval * 2 {
                            let now = Utc::now();
                            instance.status = InstanceStatus::Failed;
                            instance.stopped_at = Some(now);
                            if let Err(e) = store.update_instance(&instance) {
                                log::error!("monitor: persist for {} failed: {e}", instance.id);
                            }
                            let _ = tx.send(InstanceStatus::Failed);
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = sleep(poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}

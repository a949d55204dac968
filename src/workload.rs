// src/workload.rs
//
// =============================================================================
// GPUFLOW: WORKLOAD PORT
// =============================================================================
//
// The seam between the orchestrator and whatever actually runs inside the
// container. The contract is deliberately thin: submit the input, wait,
// collect the output. Model loading and inference are the container's
// problem.
//
// Production posts to the workload's HTTP port on the rented box; the
// local executor runs in-process with scripted timing for development and
// tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

use crate::core::{Instance, Job};
use crate::error::{OrchestratorError, Result};

#[async_trait]
pub trait WorkloadExecutor: Send + Sync {
    /// Drive one job on a ready instance to completion and return its
    /// output. Errors terminalise the job as FAILED; the wall-clock
    /// deadline and cancellation live with the caller.
    async fn execute(&self, job: &Job, instance: &Instance) -> Result<Value>;
}

// ============================================================================
// 1. HTTP EXECUTOR (production)
// ============================================================================

pub struct HttpWorkloadExecutor {
    http: reqwest::Client,
    poll_interval: Duration,
}

impl HttpWorkloadExecutor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            poll_interval,
        }
    }

    fn endpoint(instance: &Instance) -> Result<String> {
        let ip = instance.public_ip.as_deref().ok_or_else(|| {
            OrchestratorError::Internal("instance has no public endpoint".to_string())
        })?;
        let port = instance.api_port.unwrap_or(8000);
        Ok(format!("http://{ip}:{port}"))
    }
}

#[async_trait]
impl WorkloadExecutor for HttpWorkloadExecutor {
    async fn execute(&self, job: &Job, instance: &Instance) -> Result<Value> {
        let base = Self::endpoint(instance)?;

        // Hand the input over.
        self.http
            .post(format!("{base}/run"))
            .json(&json!({
                "job_id": job.id,
                "job_type": job.job_type,
                "model_name": job.model_name,
                "input": job.input,
            }))
            .send()
            .await?
            .error_for_status()?;

        // Poll for the result until the caller's deadline cuts us off.
        loop {
            sleep(self.poll_interval).await;

            let status: Value = self
                .http
                .get(format!("{base}/result/{}", job.id))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match status.get("status").and_then(|v| v.as_str()) {
                Some("completed") => {
                    return Ok(status.get("output").cloned().unwrap_or(Value::Null));
                }
                Some("failed") => {
                    let msg = status
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("workload reported failure");
                    return Err(OrchestratorError::Internal(format!(
                        "workload failed: {msg}"
                    )));
                }
                // pending / running: keep polling
                _ => {}
            }
        }
    }
}

// ============================================================================
// 2. LOCAL EXECUTOR (development + tests)
// ============================================================================

enum ScriptedOutcome {
    Succeed(Value),
    Fail(String),
}

pub struct LocalWorkloadExecutor {
    duration: Mutex<Duration>,
    outcome: Mutex<ScriptedOutcome>,
}

impl LocalWorkloadExecutor {
    pub fn new() -> Self {
        Self {
            duration: Mutex::new(Duration::from_millis(30)),
            outcome: Mutex::new(ScriptedOutcome::Succeed(json!({
                "status": "completed",
                "result": "ok",
            }))),
        }
    }

    pub fn set_duration(&self, d: Duration) {
        *self.duration.lock().unwrap() = d;
    }

    pub fn succeed_with(&self, output: Value) {
        *self.outcome.lock().unwrap() = ScriptedOutcome::Succeed(output);
    }

    pub fn fail_with(&self, message: &str) {
        *self.outcome.lock().unwrap() = ScriptedOutcome::Fail(message.to_string());
    }
}

impl Default for LocalWorkloadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadExecutor for LocalWorkloadExecutor {
    async fn execute(&self, job: &Job, _instance: &Instance) -> Result<Value> {
        let duration = *self.duration.lock().unwrap();
        sleep(duration).await;

        match &*self.outcome.lock().unwrap() {
            ScriptedOutcome::Succeed(output) => {
                let mut out = output.clone();
                if let Some(obj) = out.as_object_mut() {
                    obj.insert("job_id".to_string(), json!(job.id));
                }
                Ok(out)
            }
            ScriptedOutcome::Fail(msg) => {
                Err(OrchestratorError::Internal(format!("workload failed: {msg}")))
            }
        }
    }
}

// src/error.rs
//
// =============================================================================
// GPUFLOW: ERROR TAXONOMY
// =============================================================================
//
// One closed enum for every failure the orchestrator can produce.
// Retry decisions are made against the class, never by string matching
// or by catching a blanket error at the caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed request: bad priority, missing field, unknown GPU type.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The user is over one of their quota limits.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    /// Backpressure gate is closed.
    #[error("queue full ({queued} jobs waiting)")]
    QueueFull { queued: u64 },

    /// The placement planner found no qualifying adapter.
    #[error("no placement: {0}")]
    NoPlacement(String),

    /// Transient provider failure (network, 5xx, flaky API). Retryable.
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider rejected the request outright (4xx). Not retryable.
    #[error("provider rejected request: {0}")]
    ProviderPermanent(String),

    /// The provider has no capacity right now. Retryable.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    /// Storage failure. Retryable (contention, busy database).
    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Classes a runner may retry without user intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Provider(_)
                | OrchestratorError::InsufficientResources(_)
                | OrchestratorError::Database(_)
        )
    }

    /// Short stable tag, used in logs and persisted error messages.
    pub fn class(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "VALIDATION",
            OrchestratorError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            OrchestratorError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            OrchestratorError::QueueFull { .. } => "QUEUE_FULL",
            OrchestratorError::NoPlacement(_) => "NO_PLACEMENT",
            OrchestratorError::Provider(_) => "PROVIDER_ERROR",
            OrchestratorError::ProviderPermanent(_) => "PROVIDER_PERMANENT",
            OrchestratorError::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            OrchestratorError::Timeout(_) => "TIMEOUT",
            OrchestratorError::Cancelled => "CANCELLED",
            OrchestratorError::Database(_) => "DATABASE_ERROR",
            OrchestratorError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("serialization: {e}"))
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        // 4xx means the request itself is wrong; retrying cannot help.
        let permanent = e
            .status()
            .map(|s| s.is_client_error())
            .unwrap_or(false);
        if permanent {
            OrchestratorError::ProviderPermanent(e.to_string())
        } else {
            OrchestratorError::Provider(e.to_string())
        }
    }
}

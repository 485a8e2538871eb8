//! Unified error type for the runtime layer.
//!
//! Core primitives report failures through their own `thiserror` enums. The
//! runtime folds them into [`ResilienceError`] so tower services and the
//! facade share one error type.

use bulwark_core::workflow::{LifecycleState, WorkflowError};
use bulwark_core::{BreakerError, ConfigError, RateLimitExceeded, ReplayError, ShedReason};

/// Rejections from the [`AdmissionController`](crate::admission::AdmissionController).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error("request shed: {0}")]
    Shed(ShedReason),
    #[error("admission queue full at depth {depth}")]
    QueueFull { depth: usize },
}

/// Errors surfaced by runtime components.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("invalid transition for `{entity_id}`: {from} -> {to}")]
    InvalidTransition {
        entity_id: String,
        from: String,
        to: String,
    },
    #[error("entity `{0}` is already registered")]
    DuplicateEntity(String),
    #[error("entity `{0}` is not registered")]
    UnknownEntity(String),
    #[error("workflow error: {0}")]
    Workflow(String),
    #[error(transparent)]
    Breaker(#[from] BreakerError),
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("malformed configuration: {0}")]
    ConfigFormat(#[from] serde_json::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("dependency call failed: {0}")]
    Dependency(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ResilienceError {
    /// Rejections the caller may retry later: open circuits, spent probe
    /// budgets, rate limiting and load shedding.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Breaker(_) | Self::RateLimited(_) | Self::Admission(_)
        )
    }
}

impl<S: LifecycleState> From<WorkflowError<S>> for ResilienceError {
    fn from(err: WorkflowError<S>) -> Self {
        match err {
            WorkflowError::DuplicateEntity(id) => Self::DuplicateEntity(id),
            WorkflowError::UnknownEntity(id) => Self::UnknownEntity(id),
            WorkflowError::InvalidTransition {
                entity_id,
                from,
                to,
            } => Self::InvalidTransition {
                entity_id,
                from: from.to_string(),
                to: to.to_string(),
            },
            other @ (WorkflowError::UnknownState(_) | WorkflowError::NoHistory(_)) => {
                Self::Workflow(other.to_string())
            }
        }
    }
}

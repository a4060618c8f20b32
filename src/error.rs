//! Core error taxonomy, mapped to HTTP statuses at the boundary.

use crate::container::ContainerError;
use thiserror::Error;

/// Tagged error propagated by every core component. The HTTP layer maps each
/// variant onto the status code noted in its doc comment.
#[derive(Debug, Error)]
pub enum CoreError {
    /// 400 — missing fields, bad template variables, invalid state transition.
    #[error("validation error: {0}")]
    Validation(String),

    /// 404 — entity lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// 409 — duplicate ID, provider already configured, duplicate session per agent.
    #[error("conflict: {0}")]
    Conflict(String),

    /// 403 — cross-user access, deletion of a built-in provider/skill.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// 412 — e.g. retry while batch running, append-turn on a terminal task.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// 503 — container engine ping fails; retriable with backoff one layer up.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// 504 — an Exec exceeded its timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// 500 — unexpected.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status code this error maps to at the boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Forbidden(_) => 403,
            CoreError::PreconditionFailed(_) => 412,
            CoreError::EngineUnavailable(_) => 503,
            CoreError::Timeout(_) => 504,
            CoreError::Internal(_) => 500,
        }
    }
}

impl From<ContainerError> for CoreError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::NotFound(id) => CoreError::NotFound(format!("container {id}")),
            ContainerError::ImageNotFound(img) => {
                CoreError::Validation(format!("image not found: {img}"))
            }
            ContainerError::ResourceExhausted(msg) => CoreError::Internal(msg),
            ContainerError::EngineUnavailable(msg) => CoreError::EngineUnavailable(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

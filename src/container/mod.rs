//! Container engine capability interface.
//!
//! This module provides the sandboxed execution environments Sessions run in,
//! driving Docker/Podman over the bollard API. It handles container lifecycle
//! management, resource limits, command execution (sync and streaming), and
//! file injection.
//!
//! ## Architecture
//!
//! - [`client`]: Docker/Podman API client wrapper with connection management
//! - [`orchestrator`]: high-level container lifecycle operations
//! - [`config`]: container configuration builders for programmatic setup
//! - [`executor`]: command execution within running containers, sync and streaming
//! - [`image`]: image pull/list/remove
//! - [`driver`]: the [`ContainerDriver`] trait the rest of the core depends on,
//!   plus a real (bollard-backed) and a mock (in-memory) implementation.

mod client;
mod config;
mod driver;
mod executor;
mod image;
mod orchestrator;

pub use client::{ContainerClient, ContainerClientConfig, ContainerState, RuntimeType};
pub use config::{ContainerConfig, ContainerConfigBuilder};
pub use driver::{ContainerDriver, ContainerSpec, InspectResult, MockContainerDriver, RealContainerDriver};
pub use executor::{ExecConfig, ExecEvent, ExecOutput};
pub use image::{AGENTBOX_DEFAULT_IMAGE, ImageBuilder, ImageInfo};
pub use orchestrator::{ContainerOrchestrator, ContainerOrchestratorConfig, ContainerSummary};

/// Label applied to every container this system creates, so cleanup sweeps
/// can recognize their own containers.
pub const LABEL_MANAGED: &str = "agentbox.managed";
/// Label carrying the owning Session's ID.
pub const LABEL_SESSION_ID: &str = "agentbox.sessionID";

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Docker/Podman API error
    #[error("container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Container not found
    #[error("container not found: {0}")]
    NotFound(String),

    /// Referenced image does not exist and could not be pulled
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Container engine refused to allocate resources for the request
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Container engine is unreachable; retriable without further action
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Container configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Container execution error
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("container error: {0}")]
    Other(String),
}

impl ContainerError {
    /// `EngineUnavailable` is the only kind this system will blindly retry;
    /// everything else needs a decision one layer up.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ContainerError::EngineUnavailable(_))
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

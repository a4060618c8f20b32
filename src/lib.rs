//! # AgentBox
//!
//! A server that runs headless coding-agent CLIs (Codex, Claude Code,
//! OpenCode) inside sandboxed containers on behalf of API clients.
//!
//! ## Architecture
//!
//! - **[`model`]**: the data model shared by every other module (Agent,
//!   Provider, Runtime, Skill, Session, Execution, Task, Batch).
//! - **[`container`]**: container orchestration and command execution over
//!   Docker/Podman via `bollard`, behind the `ContainerDriver` trait.
//! - **[`adapter`]**: the Engine-Adapter abstraction that turns a prompt
//!   into a concrete CLI invocation and parses that CLI's output, with one
//!   adapter per supported engine.
//! - **[`resolver`]**: composes an Agent's Provider, Runtime, Skills, and
//!   MCP servers into the effective configuration used to run it.
//! - **[`session`]**: owns the container-backed Session lifecycle.
//! - **[`task`]**: async single/multi-turn jobs run against an ephemeral
//!   Session, bounded by a global concurrency limit.
//! - **[`batch`]**: templated fan-out of many prompts over one Agent, run
//!   by a bounded worker pool with per-task retry.
//! - **[`store`]**: the in-memory repository layer behind every scheduler.
//! - **[`eventbus`]**: a topic-keyed, non-blocking pub/sub bus used to
//!   stream exec output and status changes to subscribers.
//! - **[`http`]**: the HTTP surface (REST + SSE/WebSocket) wired on top of
//!   the session/task/batch schedulers.
//! - **[`config`]**: CLI/env/file configuration loading.
//! - **[`env`]**: environment variable names and workspace path helpers.
//! - **[`error`]**: the `CoreError` type and its HTTP status mapping.

pub mod adapter;
pub mod batch;
pub mod config;
#[cfg(feature = "containers")]
pub mod container;
pub mod env;
pub mod error;
pub mod eventbus;
pub mod http;
pub mod model;
pub mod resolver;
pub mod session;
pub mod store;
pub mod task;

pub use batch::{BatchScheduler, BatchStats, CreateBatchRequest};
pub use config::AppConfig;
pub use error::{CoreError, Result};
pub use eventbus::{BusEvent, EventBus};
pub use resolver::{AgentResolver, ResolvedConfig};
pub use session::{CreateSessionRequest, ExecRequest, SessionManager};
pub use store::Store;
pub use task::{CreateTaskRequest, TaskScheduler};

#[cfg(feature = "containers")]
pub use container::{ContainerDriver, MockContainerDriver, RealContainerDriver};

//! HTTP surface: a REST API over the Session/Task/Batch Schedulers plus an
//! SSE feed of the Event Bus. Not part of the distilled core — wired on top
//! of it the way a deployment would, using the same ecosystem crates the
//! rest of this codebase reaches for elsewhere.

mod agents;
mod batch;
mod envelope;
mod error;
mod events;
mod sessions;
mod tasks;

use crate::batch::BatchScheduler;
use crate::config::AppConfig;
use crate::container::{ContainerDriver, MockContainerDriver, RealContainerDriver};
use crate::eventbus::EventBus;
use crate::session::SessionManager;
use crate::store::Store;
use crate::task::TaskScheduler;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use envelope::Envelope;
pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: Arc<SessionManager>,
    pub tasks: Arc<TaskScheduler>,
    pub batches: Arc<BatchScheduler>,
    pub bus: Arc<EventBus>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/agents", get(agents::list_agents).post(agents::create_agent))
        .route("/api/agents/{id}", get(agents::get_agent).delete(agents::delete_agent))
        .route("/api/providers", get(agents::list_providers).post(agents::create_provider))
        .route(
            "/api/providers/{id}/credential",
            post(agents::set_provider_credential).delete(agents::clear_provider_credential),
        )
        .route("/api/runtimes", get(agents::list_runtimes).post(agents::create_runtime))
        .route("/api/skills", get(agents::list_skills).post(agents::create_skill))
        .route(
            "/api/mcp-servers",
            get(agents::list_mcp_servers).post(agents::create_mcp_server),
        )
        .route(
            "/api/mcp-servers/{id}",
            get(agents::get_mcp_server).delete(agents::delete_mcp_server),
        )
        .route("/api/sessions", get(sessions::list_sessions).post(sessions::create_session))
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/sessions/{id}/stop", post(sessions::stop_session))
        .route("/api/sessions/{id}/start", post(sessions::start_session))
        .route("/api/sessions/{id}/exec", post(sessions::exec))
        .route("/api/sessions/{id}/exec/stream", post(sessions::exec_stream))
        .route("/api/sessions/{id}/executions", get(sessions::list_executions))
        .route("/api/sessions/{id}/logs", get(sessions::logs))
        .route("/api/sessions/{id}/logs/stream", get(sessions::logs_stream))
        .route("/api/sessions/{id}/stream", get(sessions::stream_ws))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/stats", get(tasks::task_stats))
        .route("/api/tasks/cleanup", post(tasks::cleanup_tasks))
        .route("/api/tasks/{id}", get(tasks::get_task).delete(tasks::delete_task))
        .route("/api/tasks/{id}/turns", post(tasks::append_turn))
        .route("/api/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/api/tasks/{id}/retry", post(tasks::retry_task))
        .route("/api/tasks/{id}/events", get(tasks::task_events))
        .route("/api/tasks/{id}/output", get(tasks::task_output))
        .route("/api/batches", get(batch::list_batches).post(batch::create_batch))
        .route("/api/batches/{id}", get(batch::get_batch))
        .route("/api/batches/{id}/tasks", get(batch::list_batch_tasks))
        .route("/api/batches/{id}/stats", get(batch::batch_stats))
        .route("/api/batches/{id}/start", post(batch::start_batch))
        .route("/api/batches/{id}/pause", post(batch::pause_batch))
        .route("/api/batches/{id}/resume", post(batch::resume_batch))
        .route("/api/batches/{id}/cancel", post(batch::cancel_batch))
        .route("/api/batches/{id}/retry", post(batch::retry_batch))
        .route("/api/batches/{id}/events", get(batch::batch_events))
        .route("/api/batches/{id}/export", get(batch::export_batch))
        .route("/api/batches/{id}/dead", get(batch::list_dead_tasks))
        .route("/api/batches/{id}/dead/retry", post(batch::retry_dead_tasks))
        .route("/api/events", get(events::sse_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Assembles a fully wired `AppState` from configuration and starts serving.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = Store::in_memory();
    let bus = EventBus::new();
    let adapters = Arc::new(crate::adapter::AdapterRegistry::with_defaults());

    if let Some(socket) = &config.container_socket {
        // SAFETY: called once at startup before any other thread reads the
        // environment; `ContainerClient::connect` falls back to `DOCKER_HOST`.
        unsafe { std::env::set_var("DOCKER_HOST", socket) };
    }
    let driver: Arc<dyn ContainerDriver> = match RealContainerDriver::new().await {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            tracing::warn!("container engine unavailable ({e}), falling back to the in-memory mock driver");
            Arc::new(MockContainerDriver::new())
        }
    };

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        driver,
        adapters,
        bus.clone(),
        config.workspace_dir.clone(),
    ));
    let tasks = TaskScheduler::new(store.clone(), Arc::clone(&sessions), bus.clone(), 8);
    let batches = BatchScheduler::new(store.clone(), Arc::clone(&sessions), bus.clone());

    match batches.recover_stale_running().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("recovered {n} batch(es) left Running from a prior process"),
        Err(e) => tracing::error!("batch recovery scan failed: {e}"),
    }

    let state = AppState {
        store,
        sessions,
        tasks,
        batches,
        bus,
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("agentbox listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}

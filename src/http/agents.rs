use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::{AppError, AppState, Envelope};
use crate::model::{Agent, McpServer, Provider, Runtime, Skill};

pub async fn list_agents(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Agent>>>, AppError> {
    Ok(Envelope::ok(state.store.agents.list().await?))
}

pub async fn create_agent(
    State(state): State<AppState>,
    Json(agent): Json<Agent>,
) -> Result<Json<Envelope<Agent>>, AppError> {
    state.store.agents.insert(agent.clone()).await?;
    Ok(Envelope::ok(agent))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Agent>>, AppError> {
    Ok(Envelope::ok(state.store.agents.get(id).await?))
}

pub async fn delete_agent(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.store.agents.delete(id).await?;
    Ok(Envelope::ok(()))
}

pub async fn list_providers(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Provider>>>, AppError> {
    Ok(Envelope::ok(state.store.providers.list().await?))
}

pub async fn create_provider(
    State(state): State<AppState>,
    Json(provider): Json<Provider>,
) -> Result<Json<Envelope<Provider>>, AppError> {
    state.store.providers.insert(provider.clone()).await?;
    Ok(Envelope::ok(provider))
}

#[derive(Deserialize)]
pub struct SetCredentialBody {
    pub api_key: String,
}

/// POST /api/providers/:id/credential — there is no separate Credential
/// entity; a Provider's credential is its own `api_key`/`is_configured` pair.
pub async fn set_provider_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetCredentialBody>,
) -> Result<Json<Envelope<Provider>>, AppError> {
    let mut provider = state.store.providers.get(id).await?;
    provider.api_key = Some(body.api_key);
    provider.is_configured = true;
    state.store.providers.update(provider.clone()).await?;
    Ok(Envelope::ok(provider))
}

pub async fn clear_provider_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Provider>>, AppError> {
    let mut provider = state.store.providers.get(id).await?;
    provider.api_key = None;
    provider.is_configured = false;
    state.store.providers.update(provider.clone()).await?;
    Ok(Envelope::ok(provider))
}

pub async fn list_runtimes(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Runtime>>>, AppError> {
    Ok(Envelope::ok(state.store.runtimes.list().await?))
}

pub async fn create_runtime(
    State(state): State<AppState>,
    Json(runtime): Json<Runtime>,
) -> Result<Json<Envelope<Runtime>>, AppError> {
    state.store.runtimes.insert(runtime.clone()).await?;
    Ok(Envelope::ok(runtime))
}

pub async fn list_skills(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Skill>>>, AppError> {
    Ok(Envelope::ok(state.store.skills.list().await?))
}

pub async fn create_skill(
    State(state): State<AppState>,
    Json(skill): Json<Skill>,
) -> Result<Json<Envelope<Skill>>, AppError> {
    state.store.skills.insert(skill.clone()).await?;
    Ok(Envelope::ok(skill))
}

pub async fn list_mcp_servers(State(state): State<AppState>) -> Result<Json<Envelope<Vec<McpServer>>>, AppError> {
    Ok(Envelope::ok(state.store.mcp_servers.list().await?))
}

pub async fn create_mcp_server(
    State(state): State<AppState>,
    Json(server): Json<McpServer>,
) -> Result<Json<Envelope<McpServer>>, AppError> {
    state.store.mcp_servers.insert(server.clone()).await?;
    Ok(Envelope::ok(server))
}

pub async fn get_mcp_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<McpServer>>, AppError> {
    Ok(Envelope::ok(state.store.mcp_servers.get(id).await?))
}

pub async fn delete_mcp_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<()>>, AppError> {
    state.store.mcp_servers.delete(id).await?;
    Ok(Envelope::ok(()))
}

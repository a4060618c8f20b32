use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use super::{AppError, AppState, Envelope};
use crate::model::Task;
use crate::task::{CreateTaskRequest, TaskStats};

#[derive(Deserialize)]
pub struct CreateTaskBody {
    pub agent_id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<Envelope<Task>>, AppError> {
    let task = state
        .tasks
        .create_task(CreateTaskRequest {
            agent_id: body.agent_id,
            prompt: body.prompt,
            attachments: body.attachments,
            webhook_url: body.webhook_url,
            timeout_secs: body.timeout_secs,
            metadata: body.metadata,
        })
        .await?;
    Ok(Envelope::ok(task))
}

pub async fn list_tasks(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Task>>>, AppError> {
    Ok(Envelope::ok(state.tasks.list().await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Task>>, AppError> {
    Ok(Envelope::ok(state.tasks.get(id).await?))
}

pub async fn delete_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.tasks.delete(id).await?;
    Ok(Envelope::ok(()))
}

#[derive(Deserialize)]
pub struct AppendTurnBody {
    pub prompt: String,
}

pub async fn append_turn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AppendTurnBody>,
) -> Result<Json<Envelope<Task>>, AppError> {
    Ok(Envelope::ok(state.tasks.append_turn(id, body.prompt).await?))
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.tasks.cancel(id);
    Ok(Envelope::ok(()))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Task>>, AppError> {
    Ok(Envelope::ok(state.tasks.retry_task(id).await?))
}

pub async fn task_output(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<String>>, AppError> {
    Ok(Envelope::ok(state.tasks.output(id).await?))
}

pub async fn task_stats(State(state): State<AppState>) -> Result<Json<Envelope<TaskStats>>, AppError> {
    Ok(Envelope::ok(state.tasks.stats().await?))
}

pub async fn cleanup_tasks(State(state): State<AppState>) -> Result<Json<Envelope<usize>>, AppError> {
    Ok(Envelope::ok(state.tasks.cleanup().await?))
}

/// GET /api/tasks/:id/events — one terminal event and close if the Task has
/// already finished, otherwise a live SSE feed of its topic.
pub async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let task = state.tasks.get(id).await?;
    let terminal_status = task
        .status
        .is_terminal()
        .then(|| format!("{:?}", task.status).to_lowercase());
    let receiver = state.bus.subscribe_task_terminal_aware(&id.to_string(), terminal_status);
    let stream = receiver.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

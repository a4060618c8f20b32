use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use super::{AppError, AppState, Envelope};
use crate::batch::{BatchStats, CreateBatchRequest};
use crate::model::{Batch, BatchTask};

#[derive(Deserialize)]
pub struct CreateBatchBody {
    pub agent_id: Uuid,
    pub name: String,
    pub prompt_template: String,
    pub inputs: Vec<HashMap<String, String>>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_concurrency() -> usize {
    1
}

fn default_auto_start() -> bool {
    true
}

pub async fn create_batch(
    State(state): State<AppState>,
    Json(body): Json<CreateBatchBody>,
) -> Result<Json<Envelope<Batch>>, AppError> {
    let batch = state
        .batches
        .create_batch(CreateBatchRequest {
            agent_id: body.agent_id,
            name: body.name,
            prompt_template: body.prompt_template,
            inputs: body.inputs,
            concurrency: body.concurrency,
            timeout_secs: body.timeout_secs,
            max_retries: body.max_retries,
            auto_start: body.auto_start,
        })
        .await?;
    Ok(Envelope::ok(batch))
}

pub async fn list_batches(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Batch>>>, AppError> {
    Ok(Envelope::ok(state.batches.list().await?))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Batch>>, AppError> {
    Ok(Envelope::ok(state.batches.get(id).await?))
}

pub async fn list_batch_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Vec<BatchTask>>>, AppError> {
    Ok(Envelope::ok(state.batches.list_tasks(id).await?))
}

pub async fn batch_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<BatchStats>>, AppError> {
    Ok(Envelope::ok(state.batches.stats(id).await?))
}

pub async fn start_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.batches.start(id).await?;
    Ok(Envelope::ok(()))
}

pub async fn pause_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.batches.pause(id).await?;
    Ok(Envelope::ok(()))
}

pub async fn resume_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.batches.resume(id).await?;
    Ok(Envelope::ok(()))
}

pub async fn cancel_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.batches.cancel(id).await?;
    Ok(Envelope::ok(()))
}

/// POST /api/batches/:id/retry — retries Failed tasks. Dead-letter tasks are
/// retried separately via `/dead/retry`.
pub async fn retry_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<usize>>, AppError> {
    Ok(Envelope::ok(state.batches.retry_failed(id).await?))
}

pub async fn list_dead_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Vec<BatchTask>>>, AppError> {
    Ok(Envelope::ok(state.batches.list_dead_tasks(id).await?))
}

pub async fn retry_dead_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<usize>>, AppError> {
    Ok(Envelope::ok(state.batches.retry_dead_tasks(id).await?))
}

#[derive(Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_export_format")]
    pub format: String,
}

fn default_export_format() -> String {
    "json".to_string()
}

/// GET /api/batches/:id/export?format=csv|json — defaults to JSON.
pub async fn export_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, AppError> {
    match query.format.as_str() {
        "csv" => {
            let csv = state.batches.export_csv(id).await?;
            Ok(([("content-type", "text/csv")], csv).into_response())
        }
        _ => Ok(Envelope::ok(state.batches.export_json(id).await?).into_response()),
    }
}

/// GET /api/batches/:id/events — one terminal event and close if the Batch
/// has already finished, otherwise a live SSE feed of its topic.
pub async fn batch_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let batch = state.batches.get(id).await?;
    let terminal_status = matches!(
        batch.status,
        crate::model::BatchStatus::Completed | crate::model::BatchStatus::Failed | crate::model::BatchStatus::Cancelled
    )
    .then(|| format!("{:?}", batch.status).to_lowercase());
    let receiver = state.bus.subscribe_batch_terminal_aware(&id.to_string(), terminal_status);
    let stream = receiver.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

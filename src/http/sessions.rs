use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use super::{AppError, AppState, Envelope};
use crate::eventbus::BusEvent;
use crate::model::{Execution, Session};
use crate::session::{CreateSessionRequest, ExecRequest};

#[derive(Deserialize)]
pub struct CreateSessionBody {
    pub agent_id: Uuid,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Envelope<Session>>, AppError> {
    let session = state
        .sessions
        .create(CreateSessionRequest {
            agent_id: body.agent_id,
        })
        .await?;
    Ok(Envelope::ok(session))
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Session>>>, AppError> {
    Ok(Envelope::ok(state.sessions.list().await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Session>>, AppError> {
    Ok(Envelope::ok(state.sessions.get(id).await?))
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Envelope<()>>, AppError> {
    state.sessions.delete(id, true).await?;
    Ok(Envelope::ok(()))
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Session>>, AppError> {
    Ok(Envelope::ok(state.sessions.stop(id).await?))
}

pub async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Session>>, AppError> {
    Ok(Envelope::ok(state.sessions.start(id).await?))
}

#[derive(Deserialize)]
pub struct ExecBody {
    pub prompt: String,
    pub thread_id_override: Option<String>,
}

pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Envelope<Execution>>, AppError> {
    let execution = state
        .sessions
        .exec(
            id,
            ExecRequest {
                prompt: body.prompt,
                thread_id_override: body.thread_id_override,
            },
        )
        .await?;
    Ok(Envelope::ok(execution))
}

/// Runs the turn with live streaming to the Event Bus and returns the final
/// Execution once it completes. Clients that want incremental output should
/// subscribe to `/api/events` before calling this.
pub async fn exec_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Envelope<Execution>>, AppError> {
    let execution = state
        .sessions
        .exec_stream(
            id,
            ExecRequest {
                prompt: body.prompt,
                thread_id_override: body.thread_id_override,
            },
        )
        .await?;
    Ok(Envelope::ok(execution))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Vec<Execution>>>, AppError> {
    Ok(Envelope::ok(state.sessions.get(id).await?.executions))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub tail: Option<String>,
}

pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Envelope<String>>, AppError> {
    let logs = state.sessions.logs(id, query.tail.as_deref()).await?;
    Ok(Envelope::ok(logs))
}

/// GET /api/sessions/:id/logs/stream — polls the container's one-shot log
/// snapshot and re-emits it as SSE whenever it grows, since the driver has no
/// streaming primitive.
pub async fn logs_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    state.sessions.get(id).await?;
    let stream = futures::stream::unfold((state, id, 0usize), |(state, id, last_len)| async move {
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let Ok(logs) = state.sessions.logs(id, None).await else {
                return None;
            };
            if logs.len() > last_len {
                let chunk = logs[last_len..].to_string();
                let new_len = logs.len();
                return Some((Ok(Event::default().data(chunk)), (state, id, new_len)));
            }
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/sessions/:id/stream — forwards this Session's Event Bus topic as
/// `{type, exec_id, content, timestamp}` JSON frames, with a 30s idle
/// heartbeat ping to keep the connection alive through proxies.
pub async fn stream_ws(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    state.sessions.get(id).await?;
    Ok(ws.on_upgrade(move |socket| forward_session_events(socket, state, id)))
}

async fn forward_session_events(mut socket: WebSocket, state: AppState, id: Uuid) {
    let mut events = state.bus.subscribe_session(&id.to_string());
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let frame = session_event_frame(&event);
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(30)) => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn session_event_frame(event: &BusEvent) -> String {
    let (kind, exec_id, content) = match event {
        BusEvent::ExecOutput { execution_id, chunk, .. } => ("output", Some(execution_id.clone()), chunk.clone()),
        BusEvent::ExecDone { execution_id, .. } => ("completed", Some(execution_id.clone()), String::new()),
        other => ("event", None, serde_json::to_string(other).unwrap_or_default()),
    };
    serde_json::json!({
        "type": kind,
        "exec_id": exec_id,
        "content": content,
        "timestamp": chrono::Utc::now(),
    })
    .to_string()
}

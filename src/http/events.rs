use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;

use super::{AppError, AppState};
use crate::error::CoreError;

#[derive(Deserialize)]
pub struct EventsQuery {
    pub session: Option<String>,
    pub task: Option<String>,
    pub batch: Option<String>,
}

/// GET /api/events?session=... | ?task=... | ?batch=... — SSE stream of the
/// matching topic on the Event Bus. Exactly one of the three must be set.
pub async fn sse_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let receiver = match (query.session, query.task, query.batch) {
        (Some(id), None, None) => state.bus.subscribe_session(&id),
        (None, Some(id), None) => state.bus.subscribe_task(&id),
        (None, None, Some(id)) => state.bus.subscribe_batch(&id),
        _ => {
            return Err(AppError(CoreError::Validation(
                "exactly one of session, task, batch must be set".to_string(),
            )))
        }
    };

    let stream = receiver.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

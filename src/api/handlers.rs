use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::engine::{BreakerEvent, RunStatus};

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.handle.status())
}

/// Breaker transitions as server-sent events. Lagged receivers skip what they missed.
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.handle.subscribe_events()).filter_map(|event| async move {
        let event = event.ok()?;
        let name = match &event {
            BreakerEvent::Opened { .. } => "opened",
            BreakerEvent::Reset { .. } => "reset",
        };
        Event::default().event(name).json_data(&event).ok().map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn reset_circuit_breaker(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    state
        .handle
        .reset_circuit_breaker()
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "reset_requested" })),
    ))
}

pub async fn stop_run(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    state.handle.stop();
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "stopping" })),
    )
}

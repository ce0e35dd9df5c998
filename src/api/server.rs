use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::engine::OrchestratorHandle;

#[derive(Clone)]
pub struct AppState {
    pub handle: OrchestratorHandle,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::get_status))
        .route("/events", get(handlers::stream_events))
        .route("/circuit-breaker/reset", post(handlers::reset_circuit_breaker))
        .route("/stop", post(handlers::stop_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    log::info!("Dashboard listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

//! Observability surface: REST reads over the watch snapshot plus a
//! WebSocket stream of engine notifications. Strictly read-only; nothing
//! here can mutate trading state.

pub mod routes;
pub mod ws;

use crate::errors::{EngineError, EngineResult};
use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/state", get(routes::get_state))
        .route("/api/signals", get(routes::get_signals))
        .route("/api/risk", get(routes::get_risk))
        .route("/api/positions", get(routes::get_positions))
        .route("/api/params", get(routes::get_params))
        .route("/api/counters", get(routes::get_counters))
        .route("/api/health", get(routes::get_health))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>) -> EngineResult<()> {
    let addr = format!("0.0.0.0:{}", state.config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Config(format!("bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "http server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| EngineError::Config(format!("server: {e}")))
}

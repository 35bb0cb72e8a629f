use crate::state::{AppState, EngineSnapshot};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use std::sync::Arc;

/// GET /api/state -- current engine snapshot (from watch channel, no lock)
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<EngineSnapshot> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(snapshot)
}

/// GET /api/signals -- ranked signals from the latest cycle
pub async fn get_signals(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(serde_json::json!({
        "snapshot_version": snapshot.snapshot_version,
        "signals": snapshot.signals,
    }))
}

/// GET /api/risk -- latest risk assessment
pub async fn get_risk(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(serde_json::json!({
        "engine_state": snapshot.engine_state,
        "risk": snapshot.risk,
    }))
}

/// GET /api/positions -- open positions and P&L roll-up
pub async fn get_positions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(serde_json::json!({
        "positions": snapshot.positions,
        "portfolio_value": snapshot.portfolio_value,
        "realized_pnl": snapshot.realized_pnl,
        "unrealized_pnl": snapshot.unrealized_pnl,
        "daily_pnl": snapshot.daily_pnl,
    }))
}

/// GET /api/params -- active calibrated parameter set
pub async fn get_params(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot_rx.borrow().clone();
    Json(serde_json::json!({ "params": snapshot.params }))
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.counters.snapshot()))
}

/// GET /api/health -- component liveness roll-up
pub async fn get_health(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let report = state.health.report(&state.config);
    let code = match report.status {
        "unhealthy" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(serde_json::json!(report)))
}

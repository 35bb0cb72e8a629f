mod calibration;
mod config;
mod domain;
mod engine;
mod errors;
mod execution;
mod feed;
mod optimizer;
mod portfolio;
mod pricing;
mod risk;
mod server;
mod signals;
mod state;

use crate::domain::ParameterSet;
use crate::engine::Engine;
use crate::feed::synthetic::SyntheticFeed;
use crate::state::{AppState, EngineEvent};
use tokio::sync::{mpsc, watch};

/// Approved actions in flight to the execution gate.
const GATE_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() {
    // Structured logging, env-filtered.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("heston_edge engine starting");

    // Load config
    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    // Shared state plus the engine's private inbox.
    let (app_state, engine_rx) = AppState::new(cfg.clone());

    // Calibrated parameters flow one way: calibration task -> engine.
    let (params_tx, params_rx) = watch::channel(ParameterSet::seed());
    // Latest market snapshot for the slow loop, published by the engine.
    let (calib_snapshot_tx, calib_snapshot_rx) = watch::channel(None);
    // Risk-approved orders on their way to execution.
    let (gate_tx, gate_rx) = mpsc::channel(GATE_CHANNEL_CAPACITY);

    // ── Spawn tasks ──

    // 1. Market feed (synthetic surface generator)
    let feed = SyntheticFeed::new(&cfg);
    let feed_state = app_state.clone();
    let feed_tx = app_state.engine_tx.clone();
    let feed_interval = cfg.cycle_secs;
    tokio::spawn(async move {
        feed::run_feed(feed, feed_interval, feed_state, feed_tx).await;
    });

    // 2. Slow-loop calibration
    let calib_cfg = cfg.clone();
    let calib_tx = app_state.engine_tx.clone();
    tokio::spawn(async move {
        calibration::run_calibration(calib_cfg, calib_snapshot_rx, params_tx, calib_tx).await;
    });

    // 3. Paper execution gate
    let gate_cfg = cfg.clone();
    let gate_engine_tx = app_state.engine_tx.clone();
    tokio::spawn(async move {
        execution::run_paper_gate(gate_cfg, gate_rx, gate_engine_tx).await;
    });

    // 4. Fast-cycle ticker
    let tick_tx = app_state.engine_tx.clone();
    let cycle_secs = cfg.cycle_secs;
    tokio::spawn(async move {
        engine::run_ticker(cycle_secs, tick_tx).await;
    });

    // 5. Engine task (core loop -- this is the hot path)
    let engine = Engine::new(app_state.clone(), params_rx, calib_snapshot_tx, gate_tx);
    tokio::spawn(async move {
        engine.run(engine_rx).await;
    });

    // 6. Ctrl-C -> orderly engine shutdown
    let shutdown_tx = app_state.engine_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down engine");
            let _ = shutdown_tx.send(EngineEvent::Shutdown).await;
        }
    });

    // 7. Axum HTTP + WS server (foreground)
    if let Err(e) = server::run_server(app_state).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

mod bootstrap;
mod config;
mod error;
mod lanes;
mod ledger;
mod lifecycle;
mod notify;
mod scheduler;
mod state;
mod store;

use crate::config::load_config;
use crate::error::ApiError;
use crate::lanes::{compile_lanes, lane_for_period_hours};
use crate::ledger::GatewayLedgerClient;
use crate::notify::Notifier;
use crate::scheduler::now_epoch_ms;
use crate::state::{AppState, CycleCounters};
use crate::store::StartTimeStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);
    let lanes = Arc::new(compile_lanes(&cfg.lanes)?);
    eprintln!("[main] lanes={} network={}", lanes.len(), cfg.ledger.network);

    let ledger = GatewayLedgerClient::new(&cfg.ledger)
        .map_err(|e| anyhow::anyhow!("ledger client: {e}"))?;
    let start_times = StartTimeStore::load(&cfg.start_time_file, lanes.len())
        .context("loading start time store")?;

    let state = AppState {
        cfg: cfg.clone(),
        lanes,
        ledger: Arc::new(ledger),
        start_times: Arc::new(start_times),
        notifier: Notifier::new(),
        cycle_running: Arc::new(DashMap::new()),
        scheduler_ready: Arc::new(AtomicBool::new(false)),
        counters: Arc::new(CycleCounters::new()),
    };

    // A first-ever initialization also seeds one open round per lane; on
    // every later start the lanes pick up their open rounds themselves.
    // Ledger failures here are contained, not fatal.
    bootstrap::run(&state, now_epoch_ms()).await;

    scheduler::start(&state);
    state.scheduler_ready.store(true, Ordering::Release);

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/get_current_time", post(get_current_time))
        .route("/ws", get(notify::ws_subscribe))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port)
        .parse()
        .context("parsing API bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    eprintln!("[main] listening addr={addr}");
    axum::serve(listener, app).await.context("serving API")?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "scheduler_ready": state.scheduler_ready.load(Ordering::Acquire),
    }))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut body = state.counters.snapshot_json();
    body["start_times"] = serde_json::json!(state.start_times.snapshot().await);
    Json(body)
}

#[derive(Debug, Deserialize)]
struct CurrentTimeRequest {
    #[serde(rename = "timeFrame")]
    time_frame: u32,
}

/// Countdown endpoint for the webapp: milliseconds until the named lane's
/// round ends. Can go negative while a cycle is pending or retrying.
async fn get_current_time(
    State(state): State<AppState>,
    Json(req): Json<CurrentTimeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lane = lane_for_period_hours(&state.lanes, req.time_frame)
        .ok_or_else(|| ApiError::bad_request(format!("unknown time frame {}", req.time_frame)))?;
    let rest_time = state.start_times.remaining_ms(lane, now_epoch_ms()).await;
    Ok(Json(serde_json::json!({ "rest_time": rest_time })))
}

//! HTTP API handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::engine::{Engine, EngineStatus};
use crate::risk::RiskSnapshot;
use crate::trading::{PnlSummary, Position};

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// The running engine.
    pub engine: Arc<Engine>,
    /// Whether startup (state restore) has finished.
    pub ready: Arc<AtomicBool>,
    /// Prometheus render handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create new app state.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            ready: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    /// Attach a Prometheus handle for `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.engine.is_stopping()
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether service is ready.
    pub ready: bool,
    /// Whether new sets may be opened right now.
    pub can_trade: bool,
}

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Service status.
    pub status: &'static str,
    /// Engine counters.
    pub engine: EngineStatus,
    /// Risk view.
    pub risk: RiskSnapshot,
    /// P&L summary.
    pub pnl: PnlSummary,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let response = ReadyResponse {
        ready: state.is_ready(),
        can_trade: state.engine.risk_snapshot().can_trade,
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Status handler - engine, risk and P&L in one document.
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.engine.is_stopping() {
        "stopping"
    } else if state.is_ready() {
        "running"
    } else {
        "starting"
    };

    Json(StatusResponse {
        status,
        engine: state.engine.status(),
        risk: state.engine.risk_snapshot(),
        pnl: state.engine.pnl_summary(),
    })
}

/// Open positions.
pub async fn positions(State(state): State<AppState>) -> Json<Vec<Position>> {
    Json(state.engine.open_positions())
}

/// Risk snapshot.
pub async fn risk(State(state): State<AppState>) -> Json<RiskSnapshot> {
    Json(state.engine.risk_snapshot())
}

/// P&L summary.
pub async fn pnl(State(state): State<AppState>) -> Json<PnlSummary> {
    Json(state.engine.pnl_summary())
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ),
    }
}

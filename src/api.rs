use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{error, info};

use crate::config::ServiceDefinition;
use crate::models::{RoundHeader, ScorePoint};
use crate::state::StatusBoard;
use crate::store::{ResultLog, StoreError};

const HISTORY_LIMIT: usize = 30;
const RECENT_ROUNDS_LIMIT: usize = 15;

#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
    pub log: Arc<dyn ResultLog>,
    pub services: Arc<Vec<ServiceDefinition>>,
    pub check_interval_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    /// `None` until the first round has finished.
    pub up: Option<bool>,
    pub points_earned: u32,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub last_check_time: Option<String>,
    pub next_check_in: u64,
    pub is_checking: bool,
    pub round_score: u32,
    pub max_score_per_round: u32,
    pub check_interval: u64,
    pub cumulative_score: Option<u64>,
    pub round_count: Option<u64>,
    pub services: BTreeMap<String, ServiceStatus>,
}

#[derive(Debug, Serialize)]
pub struct ServiceView {
    pub id: String,
    pub name: String,
    pub machine: String,
    pub host: String,
    pub port: u16,
    pub check_type: &'static str,
    pub points_per_round: u32,
    pub up: Option<bool>,
    pub message: String,
    pub points_last_round: u32,
    pub total_points: u64,
    pub total_checks: u64,
    pub uptime_pct: f64,
}

pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Result log query failed: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "result log unavailable" })),
        )
            .into_response()
    }
}

/// Live snapshot plus running totals. Totals are `null` when the result log
/// cannot be read; the live part is always served.
///
/// Totals are read before the snapshot. A round is saved before it is
/// published, so the totals never run ahead of the live round.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let cumulative_score = state.log.cumulative_score().await.ok();
    let round_count = state.log.round_count().await.ok();
    let snapshot = state.board.snapshot().await;

    let services = state
        .services
        .iter()
        .map(|svc| {
            let last = snapshot.current_results.get(&svc.id);
            let status = ServiceStatus {
                name: svc.name.clone(),
                up: last.map(|r| r.up),
                points_earned: last.map_or(0, |r| r.points_earned),
                message: last.map(|r| r.message.clone()).unwrap_or_default(),
            };
            (svc.id.clone(), status)
        })
        .collect();

    Json(StatusResponse {
        last_check_time: snapshot.last_check_time,
        next_check_in: snapshot.next_check_in,
        is_checking: snapshot.is_checking,
        round_score: snapshot.round_score,
        max_score_per_round: snapshot.max_score,
        check_interval: state.check_interval_secs,
        cumulative_score,
        round_count,
        services,
    })
}

pub async fn get_history(State(state): State<AppState>) -> Result<Json<Vec<ScorePoint>>, ApiError> {
    Ok(Json(state.log.score_history(HISTORY_LIMIT).await?))
}

pub async fn get_rounds(State(state): State<AppState>) -> Result<Json<Vec<RoundHeader>>, ApiError> {
    Ok(Json(state.log.recent_rounds(RECENT_ROUNDS_LIMIT).await?))
}

/// Configuration, live verdict and historical totals merged per service.
pub async fn get_services(State(state): State<AppState>) -> Result<Json<Vec<ServiceView>>, ApiError> {
    let stats = state.log.service_stats().await?;
    let snapshot = state.board.snapshot().await;

    let views = state
        .services
        .iter()
        .map(|svc| {
            let last = snapshot.current_results.get(&svc.id);
            let hist = stats.get(&svc.id).cloned().unwrap_or_default();
            ServiceView {
                id: svc.id.clone(),
                name: svc.name.clone(),
                machine: svc.machine.clone(),
                host: svc.host.clone(),
                port: svc.port,
                check_type: svc.check.label(),
                points_per_round: svc.points,
                up: last.map(|r| r.up),
                message: last.map_or_else(|| "No checks run yet".to_string(), |r| r.message.clone()),
                points_last_round: last.map_or(0, |r| r.points_earned),
                total_points: hist.total_points,
                total_checks: hist.total_checks,
                uptime_pct: hist.uptime_pct(),
            }
        })
        .collect();

    Ok(Json(views))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/history", get(get_history))
        .route("/api/rounds", get(get_rounds))
        .route("/api/services", get(get_services))
        .fallback_service(ServeDir::new("public"))
        .with_state(state)
}

pub async fn start_server(port: u16, state: AppState) -> Result<()> {
    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {}", port))?;
    info!("Dashboard: http://localhost:{}", addr.port());
    axum::serve(listener, app).await.context("API server failed")?;
    Ok(())
}

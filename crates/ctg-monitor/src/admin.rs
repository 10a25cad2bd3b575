//! Admin HTTP surface: session control and operational queries.
//!
//! Failures map to explicit status codes: 400 bad input, 404 unknown
//! session/device, 409 session already active, 500 internal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::buffer::WriteBuffer;
use crate::db;
use crate::hub::FanoutHub;
use crate::metrics::{CountersSnapshot, PipelineCounters};
use crate::sessions::{SessionError, SessionManager, SessionRow, SessionStatistics};

#[derive(Clone)]
pub struct AdminState {
    pub sessions: Arc<SessionManager>,
    pub hub: Arc<FanoutHub>,
    pub buffer: WriteBuffer,
    pub counters: Arc<PipelineCounters>,
    pub pool: PgPool,
    pub started_at: Instant,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub card_id: String,
    pub device_id: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub card_id: Uuid,
    pub device_id: String,
    pub status: &'static str,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
}

impl SessionResponse {
    fn from_row(row: &SessionRow) -> Self {
        let end = row.end_time.unwrap_or_else(Utc::now);
        Self {
            session_id: row.id,
            card_id: row.card_id,
            device_id: row.device_id.clone(),
            status: if row.end_time.is_some() { "stopped" } else { "active" },
            start_time: row.start_time,
            end_time: row.end_time,
            duration_seconds: (end - row.start_time).num_seconds(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDataResponse {
    pub session_id: Uuid,
    pub fhr_data: serde_json::Value,
    pub uc_data: serde_json::Value,
    pub total_points: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub database: &'static str,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sessions: SessionStatistics,
    pub pipeline: CountersSnapshot,
    pub stream_subscribers: usize,
    pub batch_subscribers: usize,
    pub buffered_sessions: usize,
}

pub fn build_router(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/sessions/start", post(start_session))
        .route("/api/v1/sessions/stop/:session_id", post(stop_session))
        .route("/api/v1/sessions/active", get(active_sessions))
        .route("/api/v1/sessions/:session_id", get(get_session))
        .route("/api/v1/sessions/:session_id/data", get(get_session_data))
        .route("/api/v1/cards/:card_id/sessions", get(card_sessions))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id/status", get(device_status))
        .route("/api/v1/monitoring/health", get(health))
        .route("/api/v1/monitoring/stats", get(stats))
        .route("/api/v1/monitoring/cleanup", post(cleanup))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    state: AdminState,
    listen: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "admin API listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("admin API stopped");
    Ok(())
}

async fn start_session(
    State(state): State<AdminState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let card_id = Uuid::parse_str(&request.card_id)
        .map_err(|_| ApiError::bad_request("invalid card id"))?;
    if request.device_id.is_empty() {
        return Err(ApiError::bad_request("device id must not be empty"));
    }

    let session = state
        .sessions
        .start_session(card_id, &request.device_id)
        .await
        .map_err(|e| match e {
            SessionError::AlreadyActive(_) => ApiError::conflict(e.to_string()),
            SessionError::Db(db) => db.into(),
            SessionError::NotFound(_) => ApiError::not_found(e.to_string()),
        })?;

    Ok(Json(SessionResponse {
        session_id: session.id,
        card_id: session.card_id,
        device_id: session.device_id,
        status: "active",
        start_time: session.start_time,
        end_time: None,
        duration_seconds: 0,
    }))
}

async fn stop_session(
    State(state): State<AdminState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|_| ApiError::bad_request("invalid session id"))?;

    let session = state
        .sessions
        .stop_session(session_id)
        .await
        .map_err(|e| match e {
            SessionError::NotFound(_) => {
                ApiError::not_found("session not found or already stopped")
            }
            SessionError::Db(db) => db.into(),
            SessionError::AlreadyActive(_) => ApiError::conflict(e.to_string()),
        })?;

    Ok(Json(SessionResponse {
        session_id: session.id,
        card_id: session.card_id,
        device_id: session.device_id,
        status: "stopped",
        start_time: session.start_time,
        end_time: Some(session.end_time),
        duration_seconds: (session.end_time - session.start_time).num_seconds(),
    }))
}

async fn active_sessions(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let now = Utc::now();
    let sessions: Vec<SessionResponse> = state
        .sessions
        .list_active()
        .await
        .into_iter()
        .map(|s| SessionResponse {
            session_id: s.id,
            card_id: s.card_id,
            device_id: s.device_id,
            status: "active",
            start_time: s.start_time,
            end_time: None,
            duration_seconds: (now - s.start_time).num_seconds(),
        })
        .collect();
    Json(serde_json::json!({ "count": sessions.len(), "sessions": sessions }))
}

async fn get_session(
    State(state): State<AdminState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|_| ApiError::bad_request("invalid session id"))?;
    let row = state
        .sessions
        .get_stored(session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    Ok(Json(SessionResponse::from_row(&row)))
}

async fn get_session_data(
    State(state): State<AdminState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDataResponse>, ApiError> {
    let session_id = Uuid::parse_str(&session_id)
        .map_err(|_| ApiError::bad_request("invalid session id"))?;
    let row = state
        .sessions
        .get_stored(session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;

    let total_points = row.fhr_data.count + row.uc_data.count;
    Ok(Json(SessionDataResponse {
        session_id: row.id,
        fhr_data: serde_json::to_value(&row.fhr_data.0).unwrap_or_default(),
        uc_data: serde_json::to_value(&row.uc_data.0).unwrap_or_default(),
        total_points,
    }))
}

async fn card_sessions(
    State(state): State<AdminState>,
    Path(card_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let card_id =
        Uuid::parse_str(&card_id).map_err(|_| ApiError::bad_request("invalid card id"))?;
    let sessions: Vec<SessionResponse> = state
        .sessions
        .list_by_card(card_id)
        .await?
        .iter()
        .map(SessionResponse::from_row)
        .collect();
    Ok(Json(serde_json::json!({
        "card_id": card_id,
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

async fn list_devices(
    State(state): State<AdminState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.sessions.list_devices().await?;
    Ok(Json(serde_json::json!({
        "count": devices.len(),
        "devices": devices,
    })))
}

async fn device_status(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(session) = state.sessions.get_active(&device_id).await {
        let duration = (Utc::now() - session.start_time).num_seconds();
        return Ok(Json(serde_json::json!({
            "device_id": device_id,
            "status": "active",
            "session_id": session.id,
            "start_time": session.start_time,
            "duration_seconds": duration,
        })));
    }

    let known = state.sessions.list_devices().await?;
    if !known.iter().any(|d| *d == device_id) {
        return Err(ApiError::not_found("unknown device"));
    }
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "status": "idle",
    })))
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let db_ok = db::health_check(&state.pool).await;
    Json(HealthResponse {
        status: if db_ok { "healthy" } else { "degraded" },
        service: "ctg-monitor",
        timestamp: Utc::now(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        database: if db_ok { "up" } else { "down" },
        active_sessions: state.sessions.active_count().await,
    })
}

async fn stats(State(state): State<AdminState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        sessions: state.sessions.statistics().await?,
        pipeline: state.counters.snapshot(),
        stream_subscribers: state.hub.stream_subscriber_count().await,
        batch_subscribers: state.hub.batch_subscriber_count().await,
        buffered_sessions: state.buffer.buffer_count().await,
    }))
}

async fn cleanup(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let closed = state.sessions.sweep().await;
    Json(serde_json::json!({
        "message": "session cleanup complete",
        "closed_sessions": closed,
        "active_sessions": state.sessions.active_count().await,
    }))
}

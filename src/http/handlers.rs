use super::state::AppState;
use crate::error::{DispatchError, StartError};
use crate::session::{SessionRequest, SessionStatus, StatusReport};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSessionResponse {
    pub acknowledged: bool,
    pub session_id: Uuid,
    pub status: SessionStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub active: usize,
    pub capacity: usize,
    pub sessions: Vec<StatusReport>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn dispatch_error_response(e: DispatchError) -> Response {
    let status = match &e {
        DispatchError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::Start(StartError::Token(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchError::Start(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, e)
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions
/// Start a voice-agent session in a room
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> impl IntoResponse {
    info!(
        "Start requested for room '{}' ({:?})",
        req.room_name, req.mode
    );

    match state.dispatcher.request_start(req) {
        Ok(ticket) => (StatusCode::OK, Json(ticket)).into_response(),
        Err(e) => {
            warn!("Session start rejected: {}", e);
            dispatch_error_response(e)
        }
    }
}

/// GET /sessions
/// List running sessions
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher = &state.dispatcher;
    (
        StatusCode::OK,
        Json(SessionListResponse {
            active: dispatcher.active_count(),
            capacity: dispatcher.capacity(),
            sessions: dispatcher.list(),
        }),
    )
}

/// GET /sessions/:session_id
/// Status of a running or recently finished session
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.dispatcher.status(session_id) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => dispatch_error_response(e),
    }
}

/// POST /sessions/:session_id/stop
/// Stop a session; waits for teardown (bounded by the stop grace period)
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> impl IntoResponse {
    info!("Stop requested for session {}", session_id);

    match state.dispatcher.stop(session_id).await {
        Ok(report) => (
            StatusCode::OK,
            Json(StopSessionResponse {
                acknowledged: true,
                session_id,
                status: report.status,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop session {}: {}", session_id, e);
            dispatch_error_response(e)
        }
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

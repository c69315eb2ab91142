use super::state::AppState;
use crate::engine::StatusReport;
use crate::error::StartError;
use crate::events::FileReady;
use crate::recording::FinalizeResult;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: StatusReport,
    /// Session lock present
    pub locked: bool,
    /// Chunk being written
    pub current_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRecordingResponse {
    pub status: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRecordingResponse {
    pub status: String,
    /// finalized, queued, discarded or missing
    pub result: String,
    pub file: Option<FileReady>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn message(status: &str) -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": status }))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.supervisor.engine();
    let response = StatusResponse {
        status: engine.status(),
        locked: engine.publisher().store().lock().is_locked(),
        current_path: engine
            .current_path()
            .await
            .map(|p| p.display().to_string()),
    };
    (StatusCode::OK, Json(response))
}

/// POST /record/start
/// Start a new recording session
pub async fn start_recording(State(state): State<AppState>) -> Response {
    if state.supervisor.engine().is_active() {
        return error_response(StatusCode::CONFLICT, "Recording already active");
    }

    info!("Starting recording via API");

    match state.supervisor.start_session("user").await {
        Ok(path) => (
            StatusCode::OK,
            Json(StartRecordingResponse {
                status: "recording".to_string(),
                path: path.display().to_string(),
            }),
        )
            .into_response(),
        Err(StartError::AlreadyActive) => {
            error_response(StatusCode::CONFLICT, "Recording already active")
        }
        Err(e) => {
            let reason = match std::error::Error::source(&e) {
                Some(source) => format!("{}: {}", e, source),
                None => e.to_string(),
            };
            error!("Failed to start recording: {}", reason);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, reason)
        }
    }
}

/// POST /record/stop
/// Stop recording and finalize the chunk
pub async fn stop_recording(State(state): State<AppState>) -> Response {
    info!("Stopping recording via API");

    match state.supervisor.stop_session().await {
        Ok(Some(result)) => {
            let label = match &result {
                FinalizeResult::Finalized(_) => "finalized",
                FinalizeResult::QueuedAsIs(_) => "queued",
                FinalizeResult::Discarded => "discarded",
                FinalizeResult::Missing => "missing",
            };
            (
                StatusCode::OK,
                Json(StopRecordingResponse {
                    status: "stopped".to_string(),
                    result: label.to_string(),
                    file: result.file().cloned(),
                }),
            )
                .into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Not recording"),
        Err(e) => {
            error!("Failed to stop recording: {:#}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stop recording: {:#}", e),
            )
        }
    }
}

/// POST /record/pause
pub async fn pause_recording(State(state): State<AppState>) -> Response {
    let engine = state.supervisor.engine();
    if !engine.is_active() {
        return error_response(StatusCode::NOT_FOUND, "Not recording");
    }
    if engine.pause() {
        message("paused")
    } else {
        error_response(StatusCode::CONFLICT, "Already paused")
    }
}

/// POST /record/resume
pub async fn resume_recording(State(state): State<AppState>) -> Response {
    let engine = state.supervisor.engine();
    if !engine.is_active() {
        return error_response(StatusCode::NOT_FOUND, "Not recording");
    }
    if engine.resume() {
        message("recording")
    } else {
        error_response(StatusCode::CONFLICT, "Not paused")
    }
}

/// POST /record/wakeup
/// Cut a power-saving backoff short
pub async fn wakeup(State(state): State<AppState>) -> Response {
    if state.supervisor.engine().force_wakeup() {
        message("woken")
    } else {
        error_response(StatusCode::NOT_FOUND, "Not recording")
    }
}

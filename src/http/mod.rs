//! Local HTTP API for controlling the recorder
//!
//! This module provides a REST API on top of the supervisor:
//! - GET /health - Health check
//! - GET /status - Engine status, lock and current chunk
//! - POST /record/start - Start a session
//! - POST /record/stop - Stop and finalize the session
//! - POST /record/pause, /record/resume - User pause
//! - POST /record/wakeup - Cut a power-saving backoff short

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, StartRecordingResponse, StatusResponse, StopRecordingResponse};
pub use routes::create_router;
pub use state::AppState;

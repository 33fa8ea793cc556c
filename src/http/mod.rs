//! HTTP API server for the external API layer
//!
//! This module provides a REST API for controlling voice-agent sessions:
//! - POST /sessions - Start a session (429 when at capacity)
//! - GET /sessions - List running sessions
//! - GET /sessions/:id - Query session status
//! - POST /sessions/:id/stop - Stop a session
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, SessionListResponse, StopSessionResponse};
pub use routes::create_router;
pub use state::AppState;

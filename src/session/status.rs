use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::pipeline::TurnState;

/// Externally visible session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    /// Connected, between listening and speaking (transcribing or reasoning)
    Active,
    Speaking,
    Listening,
    IdleTimeout,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::IdleTimeout | SessionStatus::Failed | SessionStatus::Stopped
        )
    }

    /// Status a running session reports for its current turn state
    pub fn from_turn(state: TurnState) -> Self {
        match state {
            TurnState::Listening | TurnState::Interrupted => SessionStatus::Listening,
            TurnState::Speaking => SessionStatus::Speaking,
            TurnState::Transcribing | TurnState::Reasoning => SessionStatus::Active,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Speaking => "speaking",
            SessionStatus::Listening => "listening",
            SessionStatus::IdleTimeout => "idle_timeout",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub session_id: Uuid,
    pub room_name: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Cause of a `failed` status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

use serde::{Deserialize, Serialize};

use crate::events::SessionEvent;

/// Session event message published to NATS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventMessage {
    pub session_id: String,
    /// Per-session publish order, starting at 0
    pub sequence: u64,
    /// Event tag, e.g. "transcript" or "state_changed"
    pub event_type: String,
    pub timestamp: String, // RFC3339 timestamp
    /// Event fields without the tag
    pub data: serde_json::Value,
}

impl SessionEventMessage {
    pub fn from_event(event: &SessionEvent, sequence: u64) -> serde_json::Result<Self> {
        let mut data = serde_json::to_value(&event.kind)?;
        let event_type = data
            .as_object_mut()
            .and_then(|fields| fields.remove("type"))
            .and_then(|tag| tag.as_str().map(str::to_string))
            .unwrap_or_default();

        Ok(Self {
            session_id: event.session_id.to_string(),
            sequence,
            event_type,
            timestamp: event.timestamp.to_rfc3339(),
            data,
        })
    }

    /// True for the last message a session publishes
    pub fn is_final(&self) -> bool {
        self.event_type == "ended"
    }
}

/// Transcript line for consumers that only persist conversation text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub session_id: String,
    /// "participant" for recognized speech, "agent" for replies
    pub speaker: String,
    pub text: String,
    pub timestamp: String,
}

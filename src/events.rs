// Session events
//
// Everything a session reports while running goes through one broadcast
// channel: the HTTP layer reads status from it and the NATS forwarder
// publishes it for external consumers (transcript storage, dashboards).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::pipeline::TurnState;
use crate::session::SessionStatus;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pipeline stage an absorbed error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Recognition,
    Reasoning,
    Synthesis,
    Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    StateChanged {
        from: TurnState,
        to: TurnState,
    },
    /// Recognized text of one utterance
    Transcript {
        text: String,
    },
    /// Reply text handed to synthesis; `fallback` when reasoning failed
    Response {
        text: String,
        fallback: bool,
    },
    /// Agent speech was cut off by participant speech
    Interrupted {
        speech_ms: u64,
    },
    ParticipantJoined {
        identity: String,
    },
    ParticipantLeft {
        identity: String,
    },
    RecoverableError {
        stage: Stage,
        message: String,
    },
    Ended {
        status: SessionStatus,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

/// Sending half of a session's event channel, stamped with its id
#[derive(Debug, Clone)]
pub struct EventSender {
    session_id: Uuid,
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSender {
    pub fn new(session_id: Uuid) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { session_id, tx }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, kind: SessionEventKind) {
        let _ = self.tx.send(SessionEvent {
            session_id: self.session_id,
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Consumer attached to each session's events before the session starts
pub trait EventPublisher: Send + Sync {
    fn attach(&self, events: broadcast::Receiver<SessionEvent>);
}

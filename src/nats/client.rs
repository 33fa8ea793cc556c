use anyhow::{Context, Result};
use async_nats::Client;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{SessionEventMessage, TranscriptMessage};
use crate::events::{EventPublisher, SessionEvent, SessionEventKind};

pub struct NatsClient {
    client: Client,
    subject_prefix: String,
}

impl NatsClient {
    /// Connect to NATS server
    pub async fn connect(url: &str, subject_prefix: impl Into<String>) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = async_nats::connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self {
            client,
            subject_prefix: subject_prefix.into(),
        })
    }

    pub fn event_subject(&self, session_id: Uuid) -> String {
        event_subject(&self.subject_prefix, session_id)
    }

    pub fn transcript_subject(&self, session_id: Uuid) -> String {
        transcript_subject(&self.subject_prefix, session_id)
    }

    /// Publish one session event, plus a transcript line for recognized
    /// speech and agent replies
    pub async fn publish_event(&self, event: &SessionEvent, sequence: u64) -> Result<()> {
        let subject = self.event_subject(event.session_id);
        let message = SessionEventMessage::from_event(event, sequence)?;
        let payload = serde_json::to_vec(&message)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .context("Failed to publish session event")?;

        debug!(
            "Published {} to {} (sequence={})",
            message.event_type, subject, sequence
        );

        if let Some(transcript) = transcript_line(event) {
            let payload = serde_json::to_vec(&transcript)?;
            self.client
                .publish(self.transcript_subject(event.session_id), payload.into())
                .await
                .context("Failed to publish transcript")?;
        }

        Ok(())
    }

    /// Publish a session's events until it ends or its channel closes
    pub async fn forward(&self, mut events: broadcast::Receiver<SessionEvent>) {
        let mut sequence = 0u64;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("NATS forwarder fell behind; skipped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let ended = matches!(event.kind, SessionEventKind::Ended { .. });
            if let Err(e) = self.publish_event(&event, sequence).await {
                warn!("Session {}: {:#}", event.session_id, e);
            }
            sequence += 1;

            if ended {
                if let Err(e) = self.client.flush().await {
                    warn!("Failed to flush NATS connection: {}", e);
                }
                break;
            }
        }
    }
}

/// Spawns one forwarding task per session
pub struct NatsEventPublisher {
    client: Arc<NatsClient>,
}

impl NatsEventPublisher {
    pub fn new(client: Arc<NatsClient>) -> Self {
        Self { client }
    }
}

impl EventPublisher for NatsEventPublisher {
    fn attach(&self, events: broadcast::Receiver<SessionEvent>) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move { client.forward(events).await });
    }
}

pub fn event_subject(prefix: &str, session_id: Uuid) -> String {
    format!("{}.session.{}.event", prefix, session_id)
}

pub fn transcript_subject(prefix: &str, session_id: Uuid) -> String {
    format!("{}.session.{}.transcript", prefix, session_id)
}

/// Conversation text carried by an event, if any. Fallback replies are
/// canned text and are left out.
pub fn transcript_line(event: &SessionEvent) -> Option<TranscriptMessage> {
    let (speaker, text) = match &event.kind {
        SessionEventKind::Transcript { text } => ("participant", text),
        SessionEventKind::Response { text, fallback: false } => ("agent", text),
        _ => return None,
    };
    Some(TranscriptMessage {
        session_id: event.session_id.to_string(),
        speaker: speaker.to_string(),
        text: text.clone(),
        timestamp: event.timestamp.to_rfc3339(),
    })
}

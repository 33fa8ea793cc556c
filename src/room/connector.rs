use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::token;
use super::transport::{RoomConnection, RoomEvent, RoomTransport};
use crate::error::{ConnectionError, TransportError};

/// Which remote audio the agent subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPolicy {
    /// Only the one expected remote participant's audio (1:1 mode).
    /// `None` adopts the first remote participant that publishes audio.
    AudioOnly { participant: Option<String> },
    /// Every current and future participant's audio (conference mode)
    AllTracks,
}

/// Bounded exponential backoff for transient transport failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total connection attempts, including the first (default: 3)
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry (default: 500ms)
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Joins media rooms with a signed credential
pub struct RoomConnector {
    transport: Arc<dyn RoomTransport>,
    url: String,
    retry: RetryPolicy,
}

impl RoomConnector {
    pub fn new(transport: Arc<dyn RoomTransport>, url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            url: url.into(),
            retry,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Validate the token, join the room and apply the subscription policy.
    ///
    /// Credential problems fail immediately; transient transport errors are
    /// retried with backoff before surfacing as `RetriesExhausted`.
    pub async fn connect(
        &self,
        access_token: &str,
        room_name: &str,
        policy: SubscriptionPolicy,
    ) -> Result<RoomHandle, ConnectionError> {
        let claims = token::decode_claims(access_token)?;
        let identity = token::check_claims(&claims, room_name, Utc::now().timestamp())?;

        info!(
            "Connecting to room '{}' at {} as {} ({:?})",
            room_name, self.url, identity, policy
        );

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        let session = loop {
            attempt += 1;
            match self.transport.connect(&self.url, access_token, room_name).await {
                Ok(session) => break session,
                Err(TransportError::Transient(reason)) if attempt < max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "Connect attempt {}/{} to '{}' failed: {}. Retrying in {:?}",
                        attempt, max_attempts, room_name, reason, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(TransportError::Transient(reason)) => {
                    return Err(ConnectionError::RetriesExhausted {
                        attempts: attempt,
                        last_error: reason,
                    });
                }
                Err(TransportError::Rejected(reason)) => {
                    return Err(ConnectionError::Rejected(reason));
                }
                Err(TransportError::Closed) => {
                    return Err(ConnectionError::Rejected(
                        "connection closed during join".to_string(),
                    ));
                }
            }
        };

        let connection: Arc<dyn RoomConnection> = Arc::from(session.connection);
        let local_identity = connection.local_identity().to_string();
        info!(
            "Connected to room '{}' as {} ({} remote participants)",
            room_name,
            local_identity,
            connection.remote_participants().len()
        );

        let target = match &policy {
            SubscriptionPolicy::AudioOnly { participant } => participant.clone(),
            SubscriptionPolicy::AllTracks => None,
        };

        Ok(RoomHandle {
            room_name: room_name.to_string(),
            local_identity: local_identity.clone(),
            connection: Arc::clone(&connection),
            events: RoomEvents {
                receiver: session.events,
                policy,
                target,
                local_identity,
                connection,
                closed: false,
            },
        })
    }
}

/// A live room connection
pub struct RoomHandle {
    pub room_name: String,
    pub local_identity: String,
    pub connection: Arc<dyn RoomConnection>,
    pub events: RoomEvents,
}

impl RoomHandle {
    pub fn into_parts(self) -> (Arc<dyn RoomConnection>, RoomEvents) {
        (self.connection, self.events)
    }
}

/// Room event feed with the subscription policy applied
pub struct RoomEvents {
    receiver: mpsc::Receiver<RoomEvent>,
    policy: SubscriptionPolicy,
    target: Option<String>,
    local_identity: String,
    connection: Arc<dyn RoomConnection>,
    closed: bool,
}

impl RoomEvents {
    /// Participant the 1:1 policy is bound to, once known
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Next event; a closed transport surfaces once as `Disconnected`
    pub async fn next_event(&mut self) -> Option<RoomEvent> {
        loop {
            if self.closed {
                return None;
            }

            let Some(event) = self.receiver.recv().await else {
                self.closed = true;
                return Some(RoomEvent::Disconnected {
                    reason: "transport closed".to_string(),
                });
            };

            if let RoomEvent::Disconnected { .. } = &event {
                self.closed = true;
                return Some(event);
            }

            if let RoomEvent::TrackSubscribed { stream } = &event {
                if !self.admits(stream.identity()) {
                    let (identity, track_sid) =
                        (stream.identity().to_string(), stream.track_sid().to_string());
                    debug!(
                        "Subscription policy excludes {} ({}), unsubscribing",
                        identity, track_sid
                    );
                    if let Err(e) = self.connection.unsubscribe(&identity, &track_sid).await {
                        warn!("Failed to unsubscribe {} ({}): {}", identity, track_sid, e);
                    }
                    continue;
                }
            }

            return Some(event);
        }
    }

    fn admits(&mut self, identity: &str) -> bool {
        match self.policy {
            SubscriptionPolicy::AllTracks => true,
            SubscriptionPolicy::AudioOnly { .. } => {
                if identity == self.local_identity {
                    return true;
                }
                match &self.target {
                    Some(target) => target == identity,
                    None => {
                        info!("Binding 1:1 session to participant {}", identity);
                        self.target = Some(identity.to_string());
                        true
                    }
                }
            }
        }
    }
}

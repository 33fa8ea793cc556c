// Participant registry for one room
//
// Tracks who is present and which audio stream belongs to whom, and keeps the
// mixer's source set in step with it:
// - join/track-subscribed: register, then hand the stream to the mixer
//   (never for the agent's own identity)
// - track-unsubscribed/leave: remove from the mixer first, then release the
//   stream handle and the participant record
//
// All transitions run under one async lock, so per-identity events are
// applied in order. Duplicate or out-of-order notifications from the
// transport are absorbed without error.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::transport::RoomEvent;
use crate::audio::{AudioStream, ConferenceAudioMixer};

const PARTICIPANT_EVENT_CAPACITY: usize = 64;

/// Snapshot of a registered inbound stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamHandle {
    pub identity: String,
    pub track_sid: String,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub identity: String,
    pub joined_at: DateTime<Utc>,
    pub stream: Option<StreamHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    Joined { identity: String },
    StreamAdded { identity: String, track_sid: String },
    StreamRemoved { identity: String, track_sid: String },
    Left { identity: String },
}

#[derive(Default)]
struct RegistryState {
    participants: HashMap<String, Participant>,
    /// The agent's own participant, tracked apart from the mixable set
    agent: Option<Participant>,
}

pub struct ParticipantRegistry {
    state: Mutex<RegistryState>,
    mixer: ConferenceAudioMixer,
    self_identity: String,
    events: broadcast::Sender<ParticipantEvent>,
}

impl ParticipantRegistry {
    pub fn new(mixer: ConferenceAudioMixer) -> Self {
        let self_identity = mixer.self_identity().to_string();
        let (events, _) = broadcast::channel(PARTICIPANT_EVENT_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            mixer,
            self_identity,
            events,
        }
    }

    /// Subscribe to join/leave notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ParticipantEvent> {
        self.events.subscribe()
    }

    /// Apply one room event. `Disconnected` is not a participant event and is ignored.
    pub async fn handle_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::ParticipantConnected { identity } => self.on_join(&identity).await,
            RoomEvent::TrackSubscribed { stream } => self.attach_stream(stream).await,
            RoomEvent::TrackUnsubscribed {
                identity,
                track_sid,
            } => self.detach_stream(&identity, &track_sid).await,
            RoomEvent::ParticipantDisconnected { identity } => self.on_leave(&identity).await,
            RoomEvent::Disconnected { .. } => {}
        }
    }

    pub async fn on_join(&self, identity: &str) {
        let mut state = self.state.lock().await;
        self.join_locked(&mut state, identity);
    }

    /// Bind an inbound stream to its participant and add it to the mix
    pub async fn attach_stream(&self, stream: AudioStream) {
        let mut state = self.state.lock().await;
        let identity = stream.identity().to_string();
        let track_sid = stream.track_sid().to_string();

        if identity == self.self_identity {
            debug!("Ignoring agent's own track {} for mixing", track_sid);
            return;
        }

        // out-of-order: track arrived before the join notification
        self.join_locked(&mut state, &identity);

        let Some(participant) = state.participants.get_mut(&identity) else {
            return;
        };
        if let Some(existing) = &participant.stream {
            if existing.track_sid == track_sid {
                debug!("Duplicate subscription for {} ({}), ignoring", identity, track_sid);
                return;
            }
            info!(
                "Replacing stream for {}: {} -> {}",
                identity, existing.track_sid, track_sid
            );
            self.mixer.remove_source(&identity);
            let _ = self.events.send(ParticipantEvent::StreamRemoved {
                identity: identity.clone(),
                track_sid: existing.track_sid.clone(),
            });
        }

        participant.stream = Some(StreamHandle {
            identity: identity.clone(),
            track_sid: track_sid.clone(),
            subscribed_at: Utc::now(),
        });
        self.mixer.add_source(stream);
        let _ = self.events.send(ParticipantEvent::StreamAdded {
            identity,
            track_sid,
        });
    }

    pub async fn detach_stream(&self, identity: &str, track_sid: &str) {
        let mut state = self.state.lock().await;
        let Some(participant) = state.participants.get_mut(identity) else {
            debug!("Unsubscribe for unknown participant {}, ignoring", identity);
            return;
        };

        match &participant.stream {
            Some(existing) if existing.track_sid == track_sid => {
                self.mixer.remove_source(identity);
                participant.stream = None;
                let _ = self.events.send(ParticipantEvent::StreamRemoved {
                    identity: identity.to_string(),
                    track_sid: track_sid.to_string(),
                });
            }
            _ => debug!(
                "Unsubscribe for stale track {} of {}, ignoring",
                track_sid, identity
            ),
        }
    }

    pub async fn on_leave(&self, identity: &str) {
        let mut state = self.state.lock().await;
        self.leave_locked(&mut state, identity);
    }

    /// Remove every participant, streams first
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let identities: Vec<String> = state.participants.keys().cloned().collect();
        for identity in identities {
            self.leave_locked(&mut state, &identity);
        }
        state.agent = None;
    }

    /// Snapshot of every stream currently feeding the mixer
    pub async fn current_streams(&self) -> Vec<StreamHandle> {
        let state = self.state.lock().await;
        let mut streams: Vec<StreamHandle> = state
            .participants
            .values()
            .filter_map(|p| p.stream.clone())
            .collect();
        streams.sort_by(|a, b| a.identity.cmp(&b.identity));
        streams
    }

    pub async fn participants(&self) -> Vec<Participant> {
        let state = self.state.lock().await;
        let mut participants: Vec<Participant> = state.participants.values().cloned().collect();
        participants.sort_by(|a, b| a.identity.cmp(&b.identity));
        participants
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.state.lock().await.participants.contains_key(identity)
    }

    /// The agent's own participant record, if the transport reported it
    pub async fn agent(&self) -> Option<Participant> {
        self.state.lock().await.agent.clone()
    }

    fn join_locked(&self, state: &mut RegistryState, identity: &str) {
        if identity == self.self_identity {
            if state.agent.is_none() {
                state.agent = Some(Participant {
                    identity: identity.to_string(),
                    joined_at: Utc::now(),
                    stream: None,
                });
            }
            return;
        }
        if state.participants.contains_key(identity) {
            return;
        }

        info!("Participant joined: {}", identity);
        state.participants.insert(
            identity.to_string(),
            Participant {
                identity: identity.to_string(),
                joined_at: Utc::now(),
                stream: None,
            },
        );
        let _ = self.events.send(ParticipantEvent::Joined {
            identity: identity.to_string(),
        });
    }

    fn leave_locked(&self, state: &mut RegistryState, identity: &str) {
        if identity == self.self_identity {
            state.agent = None;
            return;
        }
        let Some(participant) = state.participants.get_mut(identity) else {
            debug!("Leave for unknown participant {}, ignoring", identity);
            return;
        };

        // stream leaves the mix before the record goes away
        if let Some(stream) = participant.stream.take() {
            self.mixer.remove_source(identity);
            let _ = self.events.send(ParticipantEvent::StreamRemoved {
                identity: identity.to_string(),
                track_sid: stream.track_sid,
            });
        }
        state.participants.remove(identity);

        info!("Participant left: {}", identity);
        let _ = self.events.send(ParticipantEvent::Left {
            identity: identity.to_string(),
        });
    }
}

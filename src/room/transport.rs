use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::audio::{AudioFrame, AudioStream};
use crate::error::TransportError;

/// Events raised by a live room connection
pub enum RoomEvent {
    ParticipantConnected { identity: String },
    ParticipantDisconnected { identity: String },
    /// An inbound audio track is subscribed and producing frames
    TrackSubscribed { stream: AudioStream },
    TrackUnsubscribed { identity: String, track_sid: String },
    /// The connection ended, locally or remotely
    Disconnected { reason: String },
}

impl fmt::Debug for RoomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomEvent::ParticipantConnected { identity } => {
                write!(f, "ParticipantConnected({})", identity)
            }
            RoomEvent::ParticipantDisconnected { identity } => {
                write!(f, "ParticipantDisconnected({})", identity)
            }
            RoomEvent::TrackSubscribed { stream } => write!(
                f,
                "TrackSubscribed({}, {})",
                stream.identity(),
                stream.track_sid()
            ),
            RoomEvent::TrackUnsubscribed {
                identity,
                track_sid,
            } => write!(f, "TrackUnsubscribed({}, {})", identity, track_sid),
            RoomEvent::Disconnected { reason } => write!(f, "Disconnected({})", reason),
        }
    }
}

/// A joined room: the connection plus its event feed
pub struct RoomSession {
    pub connection: Box<dyn RoomConnection>,
    pub events: mpsc::Receiver<RoomEvent>,
}

/// Media transport that can join rooms
///
/// Implementations:
/// - `LiveKitTransport`: WebRTC rooms on a LiveKit server
/// - `LocalRoomServer`: in-process rooms for tests
#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        room_name: &str,
    ) -> Result<RoomSession, TransportError>;
}

#[async_trait]
pub trait RoomConnection: Send + Sync {
    /// Identity this connection joined as
    fn local_identity(&self) -> &str;

    /// Identities of remote participants currently in the room
    fn remote_participants(&self) -> Vec<String>;

    /// Stop receiving a remote track
    async fn unsubscribe(&self, identity: &str, track_sid: &str) -> Result<(), TransportError>;

    /// Publish an outbound audio track and return its sink
    async fn publish_audio(&self, track_name: &str) -> Result<Box<dyn AudioSink>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Outbound audio track
#[async_trait]
pub trait AudioSink: Send {
    /// Queue a frame for playback; may wait for buffer space
    async fn capture_frame(&mut self, frame: AudioFrame) -> Result<(), TransportError>;

    /// Drop everything queued but not yet played
    fn clear_queue(&mut self);
}

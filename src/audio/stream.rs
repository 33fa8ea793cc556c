use std::fmt;
use tokio::sync::mpsc;

use super::frame::AudioFrame;

/// Ownership handle over the frames of one inbound audio track.
///
/// Exactly one component holds the receiver at a time: the transport hands it
/// to the participant registry, which moves it into the mixer.
pub struct AudioStream {
    identity: String,
    track_sid: String,
    frames: mpsc::Receiver<AudioFrame>,
}

impl AudioStream {
    pub fn new(
        identity: impl Into<String>,
        track_sid: impl Into<String>,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Self {
        Self {
            identity: identity.into(),
            track_sid: track_sid.into(),
            frames,
        }
    }

    /// Create a stream plus the sender a producer writes into.
    pub fn channel(
        identity: impl Into<String>,
        track_sid: impl Into<String>,
        capacity: usize,
    ) -> (mpsc::Sender<AudioFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(identity, track_sid, rx))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn track_sid(&self) -> &str {
        &self.track_sid
    }

    /// Next frame in arrival order; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }
}

impl fmt::Debug for AudioStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioStream")
            .field("identity", &self.identity)
            .field("track_sid", &self.track_sid)
            .finish()
    }
}

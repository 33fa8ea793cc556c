//! LiveKit media transport.
//!
//! Joins rooms on a LiveKit server over WebRTC. Remote audio tracks are
//! decoded to the recognition format and handed to the session as
//! `AudioStream`s; the agent's voice is published as a microphone track.

use livekit::options::TrackPublishOptions;
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, ParticipantIdentity, RemoteAudioTrack, RemoteTrack, Room,
    RoomEvent as MediaEvent, RoomOptions, TrackSource,
};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::prelude::{AudioFrame as RtcAudioFrame, AudioSourceOptions, RtcAudioSource};
use livekit::RoomError;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{AudioSink, RoomConnection, RoomEvent, RoomSession, RoomTransport};
use crate::audio::{AudioFrame, AudioStream};
use crate::error::TransportError;

const EVENT_CAPACITY: usize = 256;
const TRACK_CAPACITY: usize = 64;
/// Outbound queue held by the WebRTC audio source
const PLAYBACK_QUEUE_MS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct LiveKitSettings {
    /// Rate remote audio is decoded to
    pub sample_rate: u32,
    pub channels: u16,
    /// Rate of the published agent track; synthesized audio must match it
    pub playback_sample_rate: u32,
    pub playback_channels: u16,
    /// Per-attempt limit on the signalling and media handshake
    pub connect_timeout: Duration,
}

impl Default for LiveKitSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            playback_sample_rate: 24000,
            playback_channels: 1,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct LiveKitTransport {
    settings: LiveKitSettings,
}

impl LiveKitTransport {
    pub fn new(settings: LiveKitSettings) -> Arc<Self> {
        Arc::new(Self { settings })
    }
}

#[async_trait]
impl RoomTransport for LiveKitTransport {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        room_name: &str,
    ) -> Result<RoomSession, TransportError> {
        let mut options = RoomOptions::default();
        options.auto_subscribe = true;
        // the connector owns retries
        options.join_retries = 0;

        let joined = tokio::time::timeout(
            self.settings.connect_timeout,
            Room::connect(url, token, options),
        )
        .await;
        let (room, media_events) = match joined {
            Ok(Ok(joined)) => joined,
            Ok(Err(e)) => return Err(classify(e)),
            Err(_) => {
                return Err(TransportError::Transient(format!(
                    "no answer from {} within {:?}",
                    url, self.settings.connect_timeout
                )))
            }
        };

        let room = Arc::new(room);
        let identity = String::from(room.local_participant().identity());
        info!("{} connected to LiveKit room '{}' at {}", identity, room_name, url);

        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        for participant in room.remote_participants().keys() {
            let _ = tx.try_send(RoomEvent::ParticipantConnected {
                identity: String::from(participant.clone()),
            });
        }
        spawn_event_forwarder(
            media_events,
            tx,
            self.settings.clone(),
            shutdown.clone(),
        );

        Ok(RoomSession {
            connection: Box::new(LiveKitConnection {
                room,
                identity,
                settings: self.settings.clone(),
                shutdown,
                connected: AtomicBool::new(true),
            }),
            events: rx,
        })
    }
}

/// Signalling and engine failures are worth another attempt; anything else
/// is the server saying no
fn classify(error: RoomError) -> TransportError {
    match error {
        RoomError::Engine(e) => TransportError::Transient(e.to_string()),
        other => TransportError::Rejected(other.to_string()),
    }
}

fn spawn_event_forwarder(
    mut media_events: mpsc::UnboundedReceiver<MediaEvent>,
    events: mpsc::Sender<RoomEvent>,
    settings: LiveKitSettings,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = media_events.recv() => match event {
                    Some(event) => event,
                    None => {
                        let _ = events
                            .send(RoomEvent::Disconnected {
                                reason: "room event feed ended".to_string(),
                            })
                            .await;
                        break;
                    }
                },
            };

            let translated = match event {
                MediaEvent::ParticipantConnected(participant) => RoomEvent::ParticipantConnected {
                    identity: String::from(participant.identity()),
                },
                MediaEvent::ParticipantDisconnected(participant) => {
                    RoomEvent::ParticipantDisconnected {
                        identity: String::from(participant.identity()),
                    }
                }
                MediaEvent::TrackSubscribed {
                    track: RemoteTrack::Audio(track),
                    publication,
                    participant,
                } => {
                    let stream = spawn_track_pump(
                        track,
                        String::from(participant.identity()),
                        String::from(publication.sid()),
                        &settings,
                        shutdown.child_token(),
                    );
                    RoomEvent::TrackSubscribed { stream }
                }
                MediaEvent::TrackUnsubscribed {
                    publication,
                    participant,
                    ..
                } => RoomEvent::TrackUnsubscribed {
                    identity: String::from(participant.identity()),
                    track_sid: String::from(publication.sid()),
                },
                MediaEvent::Disconnected { reason } => {
                    let _ = events
                        .send(RoomEvent::Disconnected {
                            reason: format!("{:?}", reason),
                        })
                        .await;
                    break;
                }
                _ => continue,
            };

            if events.send(translated).await.is_err() {
                debug!("Room event receiver dropped");
                break;
            }
        }
    });
}

/// Decode one remote audio track into an `AudioStream`
fn spawn_track_pump(
    track: RemoteAudioTrack,
    identity: String,
    track_sid: String,
    settings: &LiveKitSettings,
    cancel: CancellationToken,
) -> AudioStream {
    let (tx, stream) = AudioStream::channel(identity.clone(), track_sid.clone(), TRACK_CAPACITY);
    let (sample_rate, channels) = (settings.sample_rate, settings.channels);
    let mut native = NativeAudioStream::new(track.rtc_track(), sample_rate as i32, channels as i32);

    tokio::spawn(async move {
        debug!("Receiving audio from {} ({})", identity, track_sid);
        let per_second = sample_rate as u64 * channels as u64;
        let mut received: u64 = 0;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = native.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let timestamp_ms = received * 1000 / per_second.max(1);
            received += frame.data.len() as u64;

            let frame = AudioFrame::new(
                frame.data.to_vec(),
                frame.sample_rate,
                frame.num_channels as u16,
                timestamp_ms,
            );
            if tx.send(frame).await.is_err() {
                break;
            }
        }
        debug!("Audio from {} ({}) ended", identity, track_sid);
    });

    stream
}

struct LiveKitConnection {
    room: Arc<Room>,
    identity: String,
    settings: LiveKitSettings,
    shutdown: CancellationToken,
    connected: AtomicBool,
}

#[async_trait]
impl RoomConnection for LiveKitConnection {
    fn local_identity(&self) -> &str {
        &self.identity
    }

    fn remote_participants(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .room
            .remote_participants()
            .into_keys()
            .map(String::from)
            .collect();
        identities.sort();
        identities
    }

    async fn unsubscribe(&self, identity: &str, track_sid: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let participants = self.room.remote_participants();
        let Some(participant) = participants.get(&ParticipantIdentity::from(identity.to_string()))
        else {
            debug!("{} already left; nothing to unsubscribe", identity);
            return Ok(());
        };
        for (sid, publication) in participant.track_publications() {
            if String::from(sid) == track_sid {
                publication.set_subscribed(false);
                debug!("Unsubscribed from {} ({})", identity, track_sid);
            }
        }
        Ok(())
    }

    async fn publish_audio(&self, track_name: &str) -> Result<Box<dyn AudioSink>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (sample_rate, channels) = (
            self.settings.playback_sample_rate,
            self.settings.playback_channels,
        );
        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            sample_rate,
            channels as u32,
            PLAYBACK_QUEUE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            track_name,
            RtcAudioSource::Native(source.clone()),
        );
        let options = TrackPublishOptions {
            source: TrackSource::Microphone,
            ..Default::default()
        };
        self.room
            .local_participant()
            .publish_track(LocalTrack::Audio(track), options)
            .await
            .map_err(|e| TransportError::Rejected(format!("cannot publish audio: {}", e)))?;
        info!("{} published track '{}' at {}Hz", self.identity, track_name, sample_rate);

        Ok(Box::new(LiveKitAudioSink {
            source,
            sample_rate,
            channels,
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.room
            .close()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        info!("{} left LiveKit room", self.identity);
        Ok(())
    }
}

impl Drop for LiveKitConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let room = Arc::clone(&self.room);
                runtime.spawn(async move {
                    if let Err(e) = room.close().await {
                        warn!("Closing dropped LiveKit connection failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("LiveKit connection dropped outside a runtime; not closed"),
        }
    }
}

struct LiveKitAudioSink {
    source: NativeAudioSource,
    sample_rate: u32,
    channels: u16,
}

#[async_trait]
impl AudioSink for LiveKitAudioSink {
    async fn capture_frame(&mut self, frame: AudioFrame) -> Result<(), TransportError> {
        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            return Err(TransportError::Rejected(format!(
                "{}Hz/{}ch frame on a {}Hz/{}ch track",
                frame.sample_rate, frame.channels, self.sample_rate, self.channels
            )));
        }
        let samples_per_channel = (frame.samples.len() / self.channels.max(1) as usize) as u32;
        let frame = RtcAudioFrame {
            data: frame.samples.into(),
            sample_rate: self.sample_rate,
            num_channels: self.channels as u32,
            samples_per_channel,
        };
        // waits while the source queue is full, pacing playback in real time
        self.source
            .capture_frame(&frame)
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))
    }

    fn clear_queue(&mut self) {
        self.source.clear_buffer();
    }
}

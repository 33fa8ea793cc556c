//! In-process media rooms.
//!
//! `LocalRoomServer` implements the room transport without a network for
//! tests: remote participants are driven by the test itself, every connection
//! is auto-subscribed to every published audio track, and audio the agent
//! publishes is paced in real time and counted. A room lives until its last
//! connection leaves.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::token;
use super::transport::{AudioSink, RoomConnection, RoomEvent, RoomSession, RoomTransport};
use crate::audio::{AudioFrame, AudioStream};
use crate::error::TransportError;

const EVENT_CAPACITY: usize = 256;
const TRACK_CAPACITY: usize = 64;

type RoomDirectory = Mutex<HashMap<String, Arc<LocalRoom>>>;

pub struct LocalRoomServer {
    rooms: Arc<RoomDirectory>,
    failures: Mutex<VecDeque<TransportError>>,
    attempts: AtomicUsize,
    pace_playback: bool,
}

impl LocalRoomServer {
    pub fn new() -> Arc<Self> {
        Self::with_pacing(true)
    }

    /// `pace_playback = false` makes agent audio "play" instantly
    pub fn with_pacing(pace_playback: bool) -> Arc<Self> {
        Arc::new(Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            pace_playback,
        })
    }

    /// Get or create a room
    pub fn room(&self, name: &str) -> Arc<LocalRoom> {
        self.get_or_create(&mut lock(&self.rooms), name)
    }

    pub fn has_room(&self, name: &str) -> bool {
        lock(&self.rooms).contains_key(name)
    }

    pub fn room_count(&self) -> usize {
        lock(&self.rooms).len()
    }

    fn get_or_create(
        &self,
        rooms: &mut HashMap<String, Arc<LocalRoom>>,
        name: &str,
    ) -> Arc<LocalRoom> {
        Arc::clone(rooms.entry(name.to_string()).or_insert_with(|| {
            debug!("Creating local room '{}'", name);
            Arc::new(LocalRoom::new(name, self.pace_playback))
        }))
    }

    /// Make the next connection attempts fail with these errors, in order
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = TransportError>) {
        lock(&self.failures).extend(errors);
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoomTransport for LocalRoomServer {
    async fn connect(
        &self,
        _url: &str,
        token: &str,
        room_name: &str,
    ) -> Result<RoomSession, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }

        let identity = token::decode_claims(token)
            .ok()
            .and_then(|claims| claims.sub)
            .ok_or_else(|| TransportError::Rejected("token has no identity".to_string()))?;

        // attach under the directory lock so a departing connection
        // cannot remove the room in between
        let mut rooms = lock(&self.rooms);
        let room = self.get_or_create(&mut rooms, room_name);
        room.attach(identity, Arc::downgrade(&self.rooms))
    }
}

/// Playback counters for one published identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputStats {
    pub frames: usize,
    pub samples: usize,
    pub clears: usize,
}

#[derive(Default)]
struct RoomInner {
    next_sid: u64,
    /// remote identity -> track sid -> subscriber identity -> frame sender
    remotes: HashMap<String, HashMap<String, HashMap<String, mpsc::Sender<AudioFrame>>>>,
    connections: HashMap<String, mpsc::Sender<RoomEvent>>,
    output: HashMap<String, OutputStats>,
}

pub struct LocalRoom {
    name: String,
    inner: Mutex<RoomInner>,
    pace_playback: bool,
}

impl LocalRoom {
    fn new(name: &str, pace_playback: bool) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(RoomInner::default()),
            pace_playback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a remote participant
    pub fn join(self: &Arc<Self>, identity: &str) -> LocalParticipant {
        let mut inner = lock(&self.inner);
        inner.remotes.entry(identity.to_string()).or_default();
        for events in inner.connections.values() {
            deliver(
                events,
                RoomEvent::ParticipantConnected {
                    identity: identity.to_string(),
                },
            );
        }
        info!("Participant {} joined local room '{}'", identity, self.name);

        LocalParticipant {
            room: Arc::clone(self),
            identity: identity.to_string(),
        }
    }

    /// Drop every connection with a remote-side disconnect
    pub fn close(&self, reason: &str) {
        let mut inner = lock(&self.inner);
        for (_, events) in inner.connections.drain() {
            deliver(
                &events,
                RoomEvent::Disconnected {
                    reason: reason.to_string(),
                },
            );
        }
        for tracks in inner.remotes.values_mut() {
            for subscribers in tracks.values_mut() {
                subscribers.clear();
            }
        }
        info!("Local room '{}' closed: {}", self.name, reason);
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        lock(&self.inner).connections.contains_key(identity)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.inner).connections.len()
    }

    /// Number of live subscriptions to tracks published by `identity`
    pub fn subscriber_count(&self, identity: &str) -> usize {
        lock(&self.inner)
            .remotes
            .get(identity)
            .map(|tracks| tracks.values().map(|s| s.len()).sum())
            .unwrap_or(0)
    }

    pub fn output_stats(&self, identity: &str) -> OutputStats {
        lock(&self.inner)
            .output
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    fn attach(
        self: Arc<Self>,
        identity: String,
        directory: Weak<RoomDirectory>,
    ) -> Result<RoomSession, TransportError> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        {
            let mut inner = lock(&self.inner);
            if inner.connections.contains_key(&identity) || inner.remotes.contains_key(&identity) {
                return Err(TransportError::Rejected(format!(
                    "identity {} already in room",
                    identity
                )));
            }

            for events in inner.connections.values() {
                deliver(
                    events,
                    RoomEvent::ParticipantConnected {
                        identity: identity.clone(),
                    },
                );
            }

            for (remote, tracks) in inner.remotes.iter_mut() {
                deliver(
                    &tx,
                    RoomEvent::ParticipantConnected {
                        identity: remote.clone(),
                    },
                );
                for (sid, subscribers) in tracks.iter_mut() {
                    let (frame_tx, stream) = AudioStream::channel(remote.clone(), sid.clone(), TRACK_CAPACITY);
                    subscribers.insert(identity.clone(), frame_tx);
                    deliver(&tx, RoomEvent::TrackSubscribed { stream });
                }
            }
            inner.connections.insert(identity.clone(), tx);
        }

        info!("{} connected to local room '{}'", identity, self.name);
        Ok(RoomSession {
            connection: Box::new(LocalConnection {
                room: self,
                directory,
                identity,
                connected: AtomicBool::new(true),
            }),
            events: rx,
        })
    }

    fn publish_track(&self, identity: &str) -> String {
        let mut inner = lock(&self.inner);
        inner.next_sid += 1;
        let sid = format!("TR_{}_{}", identity, inner.next_sid);

        let mut subscribers = HashMap::new();
        for (conn_identity, events) in &inner.connections {
            let (frame_tx, stream) = AudioStream::channel(identity, sid.clone(), TRACK_CAPACITY);
            subscribers.insert(conn_identity.clone(), frame_tx);
            deliver(events, RoomEvent::TrackSubscribed { stream });
        }
        inner
            .remotes
            .entry(identity.to_string())
            .or_default()
            .insert(sid.clone(), subscribers);
        sid
    }

    fn track_senders(&self, identity: &str, sid: &str) -> Vec<mpsc::Sender<AudioFrame>> {
        lock(&self.inner)
            .remotes
            .get(identity)
            .and_then(|tracks| tracks.get(sid))
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_remote(&self, identity: &str) {
        let mut inner = lock(&self.inner);
        let Some(tracks) = inner.remotes.remove(identity) else {
            return;
        };
        for events in inner.connections.values() {
            for sid in tracks.keys() {
                deliver(
                    events,
                    RoomEvent::TrackUnsubscribed {
                        identity: identity.to_string(),
                        track_sid: sid.clone(),
                    },
                );
            }
            deliver(
                events,
                RoomEvent::ParticipantDisconnected {
                    identity: identity.to_string(),
                },
            );
        }
        info!("Participant {} left local room '{}'", identity, self.name);
    }

    fn unsubscribe(&self, subscriber: &str, identity: &str, sid: &str) {
        let mut inner = lock(&self.inner);
        if let Some(subscribers) = inner.remotes.get_mut(identity).and_then(|t| t.get_mut(sid)) {
            subscribers.remove(subscriber);
        }
    }

    fn detach(&self, identity: &str) {
        let mut inner = lock(&self.inner);
        if inner.connections.remove(identity).is_none() {
            return;
        }
        for tracks in inner.remotes.values_mut() {
            for subscribers in tracks.values_mut() {
                subscribers.remove(identity);
            }
        }
        for events in inner.connections.values() {
            deliver(
                events,
                RoomEvent::ParticipantDisconnected {
                    identity: identity.to_string(),
                },
            );
        }
        info!("{} disconnected from local room '{}'", identity, self.name);
    }

    fn record_output(&self, identity: &str, samples: usize) {
        let mut inner = lock(&self.inner);
        let stats = inner.output.entry(identity.to_string()).or_default();
        stats.frames += 1;
        stats.samples += samples;
    }

    fn record_clear(&self, identity: &str) {
        let mut inner = lock(&self.inner);
        inner.output.entry(identity.to_string()).or_default().clears += 1;
    }
}

/// A remote participant driven from this process
pub struct LocalParticipant {
    room: Arc<LocalRoom>,
    identity: String,
}

impl LocalParticipant {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn publish_audio(&self) -> LocalTrack {
        let sid = self.room.publish_track(&self.identity);
        debug!("{} published audio track {}", self.identity, sid);
        LocalTrack {
            room: Arc::clone(&self.room),
            identity: self.identity.clone(),
            sid,
        }
    }

    pub fn leave(self) {
        self.room.remove_remote(&self.identity);
    }
}

/// A published remote audio track
#[derive(Clone)]
pub struct LocalTrack {
    room: Arc<LocalRoom>,
    identity: String,
    sid: String,
}

impl LocalTrack {
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Deliver a frame to every subscriber; returns how many received it
    pub async fn send(&self, frame: AudioFrame) -> usize {
        let senders = self.room.track_senders(&self.identity, &self.sid);
        let mut delivered = 0;
        for sender in senders {
            if sender.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

struct LocalConnection {
    room: Arc<LocalRoom>,
    directory: Weak<RoomDirectory>,
    identity: String,
    connected: AtomicBool,
}

impl LocalConnection {
    /// Leave the room, removing it from the server once nobody is connected
    fn release(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(directory) = self.directory.upgrade() else {
            self.room.detach(&self.identity);
            return;
        };

        let mut rooms = lock(&directory);
        self.room.detach(&self.identity);
        if self.room.connection_count() > 0 {
            return;
        }
        let registered = rooms
            .get(&self.room.name)
            .is_some_and(|room| Arc::ptr_eq(room, &self.room));
        if registered {
            rooms.remove(&self.room.name);
            debug!("Removed empty local room '{}'", self.room.name);
        }
    }
}

#[async_trait]
impl RoomConnection for LocalConnection {
    fn local_identity(&self) -> &str {
        &self.identity
    }

    fn remote_participants(&self) -> Vec<String> {
        let mut identities: Vec<String> = lock(&self.room.inner).remotes.keys().cloned().collect();
        identities.sort();
        identities
    }

    async fn unsubscribe(&self, identity: &str, track_sid: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.room.unsubscribe(&self.identity, identity, track_sid);
        Ok(())
    }

    async fn publish_audio(&self, track_name: &str) -> Result<Box<dyn AudioSink>, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        debug!("{} publishing outbound track '{}'", self.identity, track_name);
        Ok(Box::new(LocalAudioSink {
            room: Arc::clone(&self.room),
            identity: self.identity.clone(),
            pace: self.room.pace_playback,
        }))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.release();
    }
}

struct LocalAudioSink {
    room: Arc<LocalRoom>,
    identity: String,
    pace: bool,
}

#[async_trait]
impl AudioSink for LocalAudioSink {
    async fn capture_frame(&mut self, frame: AudioFrame) -> Result<(), TransportError> {
        if !self.room.is_connected(&self.identity) {
            return Err(TransportError::Closed);
        }
        if self.pace {
            tokio::time::sleep(Duration::from_millis(frame.duration_ms())).await;
        }
        self.room.record_output(&self.identity, frame.samples.len());
        Ok(())
    }

    fn clear_queue(&mut self) {
        self.room.record_clear(&self.identity);
    }
}

fn deliver(events: &mpsc::Sender<RoomEvent>, event: RoomEvent) {
    if let Err(e) = events.try_send(event) {
        warn!("Dropping room event, subscriber not keeping up: {}", e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

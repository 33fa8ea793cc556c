// Session lifecycle
//
// One `SessionLifecycleManager` owns one room end to end:
// connect -> publish agent audio -> mixer + registry -> turn pipeline ->
// teardown. Everything the session spawns hangs off a child cancellation
// token guarded by a drop guard, so a stop, an error, or a panic in the
// worker all take the mixer, the room event loop and the status follower
// down with it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{SessionConfig, SessionMode};
use super::status::{SessionStatus, StatusReport};
use crate::audio::ConferenceAudioMixer;
use crate::error::{ConnectionError, StartError};
use crate::events::{EventSender, SessionEvent, SessionEventKind};
use crate::pipeline::{OutboundSink, PipelineExit, StageProviders, TurnPipeline, TurnState};
use crate::providers::ProviderFactory;
use crate::room::{
    ParticipantEvent, ParticipantRegistry, RoomConnection, RoomConnector, RoomEvent,
    SubscriptionPolicy,
};

const AGENT_TRACK_NAME: &str = "agent-voice";

/// Control and observation handle for a running session
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    room_name: String,
    status: watch::Receiver<StatusReport>,
    cancel: CancellationToken,
    events: EventSender,
    stop_grace: Duration,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn status(&self) -> StatusReport {
        self.status.borrow().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Ask the session to wind down; returns immediately
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session reports a terminal status
    pub async fn wait(&self) -> StatusReport {
        let mut status = self.status.clone();
        let report = match status.wait_for(|r| r.status.is_terminal()).await {
            Ok(report) => Some(report.clone()),
            // worker gone without a final report
            Err(_) => None,
        };
        report.unwrap_or_else(|| status.borrow().clone())
    }

    /// Request a stop and wait up to the grace period for the session to
    /// release its resources. Returns `false` if it did not finish in time.
    pub async fn stop(&self) -> bool {
        self.request_stop();
        tokio::time::timeout(self.stop_grace, self.wait())
            .await
            .map(|report| report.status.is_terminal())
            .unwrap_or(false)
    }
}

/// Owns one agent-in-room session
pub struct SessionLifecycleManager {
    config: SessionConfig,
    agent_token: String,
    connector: Arc<RoomConnector>,
    providers: StageProviders,
    events: EventSender,
    status: Arc<watch::Sender<StatusReport>>,
    cancel: CancellationToken,
}

impl SessionLifecycleManager {
    /// Build the session's providers and initial status; nothing is connected yet
    pub fn new(
        config: SessionConfig,
        agent_token: String,
        connector: Arc<RoomConnector>,
        factory: &dyn ProviderFactory,
    ) -> Result<Self, StartError> {
        let providers = StageProviders {
            recognizer: factory.recognizer(config.recognition_provider)?,
            reasoner: factory.reasoner(config.reasoning_provider, &config.reasoning_model)?,
            synthesizer: factory.synthesizer(config.synthesis_provider)?,
        };

        let (status, _) = watch::channel(StatusReport {
            session_id: config.session_id,
            room_name: config.room_name.clone(),
            status: SessionStatus::Starting,
            started_at: Utc::now(),
            stopped_at: None,
            error: None,
        });

        Ok(Self {
            events: EventSender::new(config.session_id),
            config,
            agent_token,
            connector,
            providers,
            status: Arc::new(status),
            cancel: CancellationToken::new(),
        })
    }

    /// Build and spawn the session worker
    pub fn start(
        config: SessionConfig,
        agent_token: String,
        connector: Arc<RoomConnector>,
        factory: &dyn ProviderFactory,
    ) -> Result<(SessionHandle, JoinHandle<StatusReport>), StartError> {
        let manager = Self::new(config, agent_token, connector, factory)?;
        let handle = manager.handle();
        let worker = tokio::spawn(manager.run());
        Ok((handle, worker))
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.config.session_id,
            room_name: self.config.room_name.clone(),
            status: self.status.subscribe(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
            stop_grace: self.config.stop_grace,
        }
    }

    /// Run the session to completion and return its final status
    pub async fn run(self) -> StatusReport {
        info!(
            "Starting session {} in room '{}' ({:?})",
            self.config.session_id, self.config.room_name, self.config.mode
        );

        let (status, error) = match self.run_connected().await {
            Ok(status) => (status, None),
            Err(e) => {
                error!("Session {} failed: {}", self.config.session_id, e);
                (SessionStatus::Failed, Some(e.to_string()))
            }
        };

        self.status.send_modify(|report| {
            report.status = status;
            report.stopped_at = Some(Utc::now());
            report.error = error.clone();
        });
        self.events.emit(SessionEventKind::Ended { status, error });
        info!(
            "Session {} in room '{}' ended: {}",
            self.config.session_id, self.config.room_name, status
        );
        self.status.borrow().clone()
    }

    async fn run_connected(&self) -> Result<SessionStatus, ConnectionError> {
        let session_id = self.config.session_id;
        let policy = match self.config.mode {
            SessionMode::OneToOne => SubscriptionPolicy::AudioOnly {
                participant: self.config.participant_identity.clone(),
            },
            SessionMode::Conference => SubscriptionPolicy::AllTracks,
        };

        let room = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(SessionStatus::Stopped),
            room = self.connector.connect(&self.agent_token, &self.config.room_name, policy) => room?,
        };
        let (connection, mut room_events) = room.into_parts();

        // Children of this token: mixer clock, room event loop, followers
        let tasks = self.cancel.child_token();
        let _tasks_guard = tasks.clone().drop_guard();

        let sink = match connection.publish_audio(AGENT_TRACK_NAME).await {
            Ok(sink) => sink,
            Err(e) => {
                disconnect(&connection, session_id).await;
                return Err(ConnectionError::Rejected(format!(
                    "failed to publish agent audio: {}",
                    e
                )));
            }
        };

        let mixer = ConferenceAudioMixer::new(self.config.mixer.clone(), connection.local_identity());
        let registry = Arc::new(ParticipantRegistry::new(mixer.clone()));

        self.spawn_participant_events(registry.subscribe(), tasks.clone());

        let (disconnected_tx, mut disconnected_rx) = oneshot::channel::<String>();
        {
            let registry = Arc::clone(&registry);
            let tasks = tasks.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = tasks.cancelled() => break,
                        event = room_events.next_event() => event,
                    };
                    match event {
                        Some(RoomEvent::Disconnected { reason }) => {
                            let _ = disconnected_tx.send(reason);
                            break;
                        }
                        Some(event) => registry.handle_event(event).await,
                        None => break,
                    }
                }
                debug!("Session {} room event loop finished", session_id);
            });
        }

        let mixed = mixer.start(tasks.child_token());
        let (mut pipeline, turn_state) = TurnPipeline::new(
            self.providers.clone(),
            OutboundSink::new(sink),
            self.config.pipeline_config(),
            self.events.clone(),
        );
        self.spawn_status_follower(turn_state, tasks.clone());
        self.set_status(SessionStatus::Listening);

        let outcome = tokio::select! {
            biased;
            Ok(reason) = &mut disconnected_rx => {
                warn!("Session {}: room disconnected: {}", session_id, reason);
                Err(ConnectionError::Disconnected(reason))
            }
            exit = pipeline.run(mixed, tasks.clone()) => match exit {
                PipelineExit::Stopped => Ok(SessionStatus::Stopped),
                PipelineExit::IdleTimeout => Ok(SessionStatus::IdleTimeout),
                PipelineExit::InputClosed if self.cancel.is_cancelled() => Ok(SessionStatus::Stopped),
                PipelineExit::InputClosed => Err(ConnectionError::Disconnected(
                    "inbound audio ended".to_string(),
                )),
            },
        };

        self.teardown(&connection, &registry, &mixer, &tasks).await;
        outcome
    }

    /// Release everything the session holds: pipeline children first, then
    /// streams, then the room connection.
    async fn teardown(
        &self,
        connection: &Arc<dyn RoomConnection>,
        registry: &ParticipantRegistry,
        mixer: &ConferenceAudioMixer,
        tasks: &CancellationToken,
    ) {
        let session_id = self.config.session_id;
        tasks.cancel();

        for stream in registry.current_streams().await {
            if let Err(e) = connection.unsubscribe(&stream.identity, &stream.track_sid).await {
                debug!(
                    "Session {}: unsubscribe {} ({}) failed: {}",
                    session_id, stream.identity, stream.track_sid, e
                );
            }
        }
        registry.clear().await;
        mixer.shutdown();
        disconnect(connection, session_id).await;
        info!("Session {} released room '{}'", session_id, self.config.room_name);
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_if_modified(|report| {
            if report.status.is_terminal() || report.status == status {
                return false;
            }
            report.status = status;
            true
        });
    }

    fn spawn_status_follower(&self, mut turn_state: watch::Receiver<TurnState>, tasks: CancellationToken) {
        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tasks.cancelled() => break,
                    changed = turn_state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = SessionStatus::from_turn(*turn_state.borrow_and_update());
                        status.send_if_modified(|report| {
                            if report.status.is_terminal() || report.status == next {
                                return false;
                            }
                            report.status = next;
                            true
                        });
                    }
                }
            }
        });
    }

    fn spawn_participant_events(
        &self,
        mut participants: broadcast::Receiver<ParticipantEvent>,
        tasks: CancellationToken,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tasks.cancelled() => break,
                    event = participants.recv() => event,
                };
                match event {
                    Ok(ParticipantEvent::Joined { identity }) => {
                        events.emit(SessionEventKind::ParticipantJoined { identity })
                    }
                    Ok(ParticipantEvent::Left { identity }) => {
                        events.emit(SessionEventKind::ParticipantLeft { identity })
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session {}: dropped {} participant events", events.session_id(), n)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

async fn disconnect(connection: &Arc<dyn RoomConnection>, session_id: Uuid) {
    if let Err(e) = connection.disconnect().await {
        warn!("Session {}: disconnect failed: {}", session_id, e);
    }
}

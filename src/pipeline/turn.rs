// Turn pipeline for one session
//
// Listening -> Transcribing -> Reasoning -> Speaking -> Listening
//
// Each busy stage runs as an owned future raced against the input stream and
// the session's cancellation token. While a stage is in flight, input frames
// keep flowing through the VAD; when interruptions are enabled and enough
// speech accumulates, the stage future is dropped on the spot. Dropping it
// releases the provider call and the outbound writer (which clears the
// transport queue) before the next state is entered.

use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sink::{OutboundSink, SinkWriter};
use super::state::{TurnMachine, TurnState};
use crate::audio::{AudioFrame, Utterance, VadConfig, VadEvent, VoiceActivityDetector};
use crate::error::{ProviderError, TransportError};
use crate::events::{EventSender, SessionEventKind, Stage};
use crate::providers::{ChatMessage, Reasoner, Recognizer, Synthesizer};

/// Deadlines for each provider call
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    pub recognition: Duration,
    pub reasoning: Duration,
    /// Applies to opening the synthesis stream and to each frame after it
    pub synthesis: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            recognition: Duration::from_secs(10),
            reasoning: Duration::from_secs(15),
            synthesis: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub interruptions_enabled: bool,
    /// Speech needed during a busy stage before it is cut off
    pub interruption_min_speech_ms: u64,
    pub system_prompt: String,
    pub greeting: Option<String>,
    pub voice_id: String,
    /// Spoken when reasoning fails or times out
    pub fallback_message: String,
    /// Window without an utterance boundary before the session gives up
    pub idle_timeout: Duration,
    pub timeouts: StageTimeouts,
    pub vad: VadConfig,
    /// Prior user/assistant messages kept for context
    pub max_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            interruptions_enabled: true,
            interruption_min_speech_ms: 300,
            system_prompt: String::new(),
            greeting: None,
            voice_id: "alloy".to_string(),
            fallback_message: "Sorry, I'm having trouble answering right now. Could you say that again?".to_string(),
            idle_timeout: Duration::from_secs(300),
            timeouts: StageTimeouts::default(),
            vad: VadConfig::default(),
            max_history: 20,
        }
    }
}

/// The three stage implementations a session was configured with
#[derive(Clone)]
pub struct StageProviders {
    pub recognizer: Arc<dyn Recognizer>,
    pub reasoner: Arc<dyn Reasoner>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

/// Why the pipeline loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// Cancellation token fired
    Stopped,
    /// No utterance boundary within the idle window
    IdleTimeout,
    /// The inbound audio stream ended
    InputClosed,
}

enum StageOutcome<T> {
    Done(T),
    Interrupted { speech_ms: u64 },
    Cancelled,
    InputClosed,
}

enum Flow {
    Continue,
    Exit(PipelineExit),
}

enum SpeechOutcome {
    Completed,
    Failed,
    Interrupted,
    Exit(PipelineExit),
}

#[derive(Debug, Error)]
enum PlaybackError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Outbound sink failed: {0}")]
    Sink(#[from] TransportError),

    #[error("Outbound sink is held by another stage")]
    SinkBusy,
}

impl PlaybackError {
    fn stage(&self) -> Stage {
        match self {
            PlaybackError::Provider(_) => Stage::Synthesis,
            PlaybackError::Sink(_) | PlaybackError::SinkBusy => Stage::Transport,
        }
    }
}

pub struct TurnPipeline {
    providers: StageProviders,
    sink: OutboundSink,
    config: PipelineConfig,
    machine: TurnMachine,
    vad: VoiceActivityDetector,
    events: EventSender,
    history: Vec<ChatMessage>,
}

impl TurnPipeline {
    pub fn new(
        providers: StageProviders,
        sink: OutboundSink,
        config: PipelineConfig,
        events: EventSender,
    ) -> (Self, watch::Receiver<TurnState>) {
        let (machine, state_rx) = TurnMachine::new(events.clone());
        let vad = VoiceActivityDetector::new(config.vad.clone());
        (
            Self {
                providers,
                sink,
                config,
                machine,
                vad,
                events,
                history: Vec::new(),
            },
            state_rx,
        )
    }

    pub fn state(&self) -> TurnState {
        self.machine.state()
    }

    /// Conversation so far, oldest first
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Drive turns until cancelled, idle, or the input ends
    pub async fn run(
        &mut self,
        mut input: mpsc::Receiver<AudioFrame>,
        cancel: CancellationToken,
    ) -> PipelineExit {
        let session_id = self.events.session_id();

        if let Some(greeting) = self.config.greeting.clone().filter(|g| !g.trim().is_empty()) {
            if let Flow::Exit(exit) = self.greet(greeting, &mut input, &cancel).await {
                return exit;
            }
        }
        // idle time is counted from the moment the agent is listening
        let mut idle_deadline = Instant::now() + self.config.idle_timeout;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return PipelineExit::Stopped,
                _ = sleep_until(idle_deadline) => {
                    info!(
                        "Session {} idle for {:?}, ending",
                        session_id, self.config.idle_timeout
                    );
                    return PipelineExit::IdleTimeout;
                }
                frame = input.recv() => match frame {
                    Some(frame) => frame,
                    None => return PipelineExit::InputClosed,
                },
            };

            let utterance = match self.vad.process(&frame) {
                VadEvent::SpeechStart { .. } => {
                    idle_deadline = Instant::now() + self.config.idle_timeout;
                    continue;
                }
                VadEvent::SpeechEnd(utterance) => utterance,
                VadEvent::Silence | VadEvent::SpeechContinue { .. } => continue,
            };
            if let Flow::Exit(exit) = self.take_turn(utterance, &mut input, &cancel).await {
                return exit;
            }
            idle_deadline = Instant::now() + self.config.idle_timeout;
            if !self.config.interruptions_enabled {
                // input heard while busy was dropped; start capture clean
                self.vad.reset();
            }
        }
    }

    async fn greet(
        &mut self,
        greeting: String,
        input: &mut mpsc::Receiver<AudioFrame>,
        cancel: &CancellationToken,
    ) -> Flow {
        if let Err(e) = self.machine.begin_agent_utterance() {
            warn!("Session {}: cannot greet: {}", self.events.session_id(), e);
            return Flow::Continue;
        }
        self.events.emit(SessionEventKind::Response {
            text: greeting.clone(),
            fallback: false,
        });

        match self.speak(greeting.clone(), input, cancel).await {
            SpeechOutcome::Completed => {
                self.remember(ChatMessage::assistant(greeting));
                Flow::Continue
            }
            SpeechOutcome::Failed | SpeechOutcome::Interrupted => Flow::Continue,
            SpeechOutcome::Exit(exit) => Flow::Exit(exit),
        }
    }

    async fn take_turn(
        &mut self,
        utterance: Utterance,
        input: &mut mpsc::Receiver<AudioFrame>,
        cancel: &CancellationToken,
    ) -> Flow {
        let session_id = self.events.session_id();
        debug!(
            "Session {}: utterance of {}ms ({}ms voiced)",
            session_id,
            utterance.duration_ms(),
            utterance.speech_ms
        );

        // Transcribing
        self.enter(TurnState::Transcribing);
        let recognizer = Arc::clone(&self.providers.recognizer);
        let deadline = self.config.timeouts.recognition;
        let recognition = async move {
            timeout(deadline, recognizer.transcribe(&utterance))
                .await
                .unwrap_or(Err(ProviderError::Timeout(deadline)))
        };

        let transcript = match self.run_stage(recognition, input, cancel).await {
            StageOutcome::Done(Ok(text)) => text,
            StageOutcome::Done(Err(e)) => {
                warn!("Session {}: recognition failed: {}", session_id, e);
                self.recoverable(Stage::Recognition, &e);
                self.enter(TurnState::Listening);
                return Flow::Continue;
            }
            other => return self.abandon(other),
        };

        if transcript.trim().is_empty() {
            debug!("Session {}: empty transcript, back to listening", session_id);
            self.enter(TurnState::Listening);
            return Flow::Continue;
        }
        info!("Session {} heard: {}", session_id, transcript);
        self.events.emit(SessionEventKind::Transcript {
            text: transcript.clone(),
        });
        self.remember(ChatMessage::user(transcript));

        // Reasoning
        self.enter(TurnState::Reasoning);
        let reasoner = Arc::clone(&self.providers.reasoner);
        let deadline = self.config.timeouts.reasoning;
        let system_prompt = self.config.system_prompt.clone();
        let history = self.history.clone();
        let reasoning = async move {
            timeout(deadline, reasoner.respond(&system_prompt, &history))
                .await
                .unwrap_or(Err(ProviderError::Timeout(deadline)))
        };

        let (reply, fallback) = match self.run_stage(reasoning, input, cancel).await {
            StageOutcome::Done(Ok(reply)) => (reply, false),
            StageOutcome::Done(Err(e)) => {
                warn!(
                    "Session {}: reasoning failed, using fallback: {}",
                    session_id, e
                );
                self.recoverable(Stage::Reasoning, &e);
                (self.config.fallback_message.clone(), true)
            }
            other => return self.abandon(other),
        };

        // Speaking
        self.enter(TurnState::Speaking);
        info!("Session {} replying: {}", session_id, reply);
        self.events.emit(SessionEventKind::Response {
            text: reply.clone(),
            fallback,
        });

        match self.speak(reply.clone(), input, cancel).await {
            SpeechOutcome::Completed => {
                if !fallback {
                    self.remember(ChatMessage::assistant(reply));
                }
                Flow::Continue
            }
            // a reply that was cut off never reaches the conversation history
            SpeechOutcome::Failed | SpeechOutcome::Interrupted => Flow::Continue,
            SpeechOutcome::Exit(exit) => Flow::Exit(exit),
        }
    }

    /// Play `text` through the outbound sink; the caller has entered Speaking.
    async fn speak(
        &mut self,
        text: String,
        input: &mut mpsc::Receiver<AudioFrame>,
        cancel: &CancellationToken,
    ) -> SpeechOutcome {
        let playback = play(
            Arc::clone(&self.providers.synthesizer),
            self.sink.try_acquire(),
            text,
            self.config.voice_id.clone(),
            self.config.timeouts.synthesis,
        );

        match self.run_stage(playback, input, cancel).await {
            StageOutcome::Done(Ok(frames)) => {
                debug!(
                    "Session {}: played {} frames",
                    self.events.session_id(),
                    frames
                );
                self.enter(TurnState::Listening);
                SpeechOutcome::Completed
            }
            StageOutcome::Done(Err(e)) => {
                warn!("Session {}: playback failed: {}", self.events.session_id(), e);
                self.events.emit(SessionEventKind::RecoverableError {
                    stage: e.stage(),
                    message: e.to_string(),
                });
                self.enter(TurnState::Listening);
                SpeechOutcome::Failed
            }
            other => match self.abandon(other) {
                Flow::Continue => SpeechOutcome::Interrupted,
                Flow::Exit(exit) => SpeechOutcome::Exit(exit),
            },
        }
    }

    /// Race a stage against cancellation and input speech
    async fn run_stage<F>(
        &mut self,
        stage: F,
        input: &mut mpsc::Receiver<AudioFrame>,
        cancel: &CancellationToken,
    ) -> StageOutcome<F::Output>
    where
        F: Future,
    {
        tokio::pin!(stage);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StageOutcome::Cancelled,
                output = &mut stage => return StageOutcome::Done(output),
                frame = input.recv() => match frame {
                    Some(frame) => {
                        if let Some(speech_ms) = self.detect_barge_in(&frame) {
                            return StageOutcome::Interrupted { speech_ms };
                        }
                    }
                    None => return StageOutcome::InputClosed,
                },
            }
        }
    }

    fn detect_barge_in(&mut self, frame: &AudioFrame) -> Option<u64> {
        if !self.config.interruptions_enabled {
            return None;
        }
        match self.vad.process(frame) {
            VadEvent::SpeechStart { speech_ms } | VadEvent::SpeechContinue { speech_ms }
                if speech_ms >= self.config.interruption_min_speech_ms =>
            {
                Some(speech_ms)
            }
            VadEvent::SpeechEnd(utterance) => {
                debug!(
                    "Session {}: {}ms of speech while busy, below barge-in threshold",
                    self.events.session_id(),
                    utterance.speech_ms
                );
                None
            }
            _ => None,
        }
    }

    /// Map a stage that did not complete onto the next step
    fn abandon<T>(&mut self, outcome: StageOutcome<T>) -> Flow {
        match outcome {
            StageOutcome::Interrupted { speech_ms } => {
                info!(
                    "Session {}: interrupted during {} after {}ms of speech",
                    self.events.session_id(),
                    self.machine.state(),
                    speech_ms
                );
                self.enter(TurnState::Interrupted);
                self.events.emit(SessionEventKind::Interrupted { speech_ms });
                self.enter(TurnState::Listening);
                Flow::Continue
            }
            StageOutcome::Cancelled => Flow::Exit(PipelineExit::Stopped),
            StageOutcome::InputClosed => Flow::Exit(PipelineExit::InputClosed),
            StageOutcome::Done(_) => Flow::Continue,
        }
    }

    fn enter(&mut self, to: TurnState) {
        if let Err(e) = self.machine.transition(to) {
            warn!("Session {}: {}", self.events.session_id(), e);
        }
    }

    fn recoverable(&self, stage: Stage, error: &ProviderError) {
        self.events.emit(SessionEventKind::RecoverableError {
            stage,
            message: error.to_string(),
        });
    }

    fn remember(&mut self, message: ChatMessage) {
        self.history.push(message);
        if self.history.len() > self.config.max_history {
            let excess = self.history.len() - self.config.max_history;
            self.history.drain(..excess);
        }
    }
}

async fn play(
    synthesizer: Arc<dyn Synthesizer>,
    writer: Option<SinkWriter>,
    text: String,
    voice: String,
    deadline: Duration,
) -> Result<usize, PlaybackError> {
    let mut writer = writer.ok_or(PlaybackError::SinkBusy)?;
    let mut stream = timeout(deadline, synthesizer.synthesize(&text, &voice))
        .await
        .map_err(|_| ProviderError::Timeout(deadline))??;

    let mut frames = 0;
    loop {
        let next = timeout(deadline, stream.next())
            .await
            .map_err(|_| ProviderError::Timeout(deadline))?;
        match next {
            Some(Ok(frame)) => {
                writer.write(frame).await?;
                frames += 1;
            }
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }
    writer.finish();
    Ok(frames)
}

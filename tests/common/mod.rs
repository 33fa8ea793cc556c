// Shared fakes and helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use loqa_voice_agent::audio::{AudioFrame, Utterance};
use loqa_voice_agent::events::{SessionEvent, SessionEventKind};
use loqa_voice_agent::pipeline::TurnState;
use loqa_voice_agent::providers::{
    ChatMessage, ProviderFactory, Reasoner, ReasoningProvider, RecognitionProvider, Recognizer,
    SynthesisProvider, SynthesisStream, Synthesizer,
};
use loqa_voice_agent::room::{AudioSink, LocalTrack};
use loqa_voice_agent::{ProviderError, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const SAMPLE_RATE: u32 = 16000;
pub const FRAME_MS: u64 = 20;

/// 20ms of a loud square wave, well above the VAD threshold
pub fn speech_frame(timestamp_ms: u64) -> AudioFrame {
    let samples = (0..(SAMPLE_RATE as usize * FRAME_MS as usize / 1000))
        .map(|i| if (i / 16) % 2 == 0 { 8000 } else { -8000 })
        .collect();
    AudioFrame::new(samples, SAMPLE_RATE, 1, timestamp_ms)
}

pub fn silence_frame(timestamp_ms: u64) -> AudioFrame {
    AudioFrame::silence(SAMPLE_RATE, 1, FRAME_MS, timestamp_ms)
}

/// Frames for `speech_ms` of speech followed by `silence_ms` of silence
pub fn utterance_frames(speech_ms: u64, silence_ms: u64) -> Vec<AudioFrame> {
    let mut frames = Vec::new();
    let mut ts = 0;
    while ts < speech_ms {
        frames.push(speech_frame(ts));
        ts += FRAME_MS;
    }
    while ts < speech_ms + silence_ms {
        frames.push(silence_frame(ts));
        ts += FRAME_MS;
    }
    frames
}

/// Publish frames on a local track in real time
pub async fn say(track: &LocalTrack, speech_ms: u64, silence_ms: u64) {
    for frame in utterance_frames(speech_ms, silence_ms) {
        track.send(frame).await;
        tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
    }
}

// ============================================================================
// Providers
// ============================================================================

#[derive(Default)]
pub struct FakeRecognizer {
    script: Mutex<VecDeque<String>>,
    default_text: String,
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeRecognizer {
    pub fn replying(text: &str) -> Self {
        Self {
            default_text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Transcripts returned in order before falling back to the default
    pub fn push(&self, text: &str) {
        self.script.lock().unwrap().push_back(text.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    fn name(&self) -> &str {
        "fake-recognizer"
    }

    async fn transcribe(&self, _utterance: &Utterance) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ProviderError::Api {
                provider: "fake",
                status: 503,
                body: "recognizer unavailable".to_string(),
            });
        }
        let scripted = self.script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| self.default_text.clone()))
    }
}

#[derive(Default)]
pub struct FakeReasoner {
    pub reply: String,
    pub delay: Duration,
    pub fail: bool,
    pub panic: bool,
    pub calls: AtomicUsize,
    pub last_history: Mutex<Vec<ChatMessage>>,
}

impl FakeReasoner {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: text.to_string(),
            ..Default::default()
        }
    }

    pub fn slow(text: &str, delay: Duration) -> Self {
        Self {
            reply: text.to_string(),
            delay,
            ..Default::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for FakeReasoner {
    fn name(&self) -> &str {
        "fake-reasoner"
    }

    async fn respond(
        &self,
        _system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_history.lock().unwrap() = history.to_vec();
        if self.panic {
            panic!("reasoner blew up");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(ProviderError::InvalidResponse("no choices".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Counts streams opened, finished and dropped
#[derive(Default)]
pub struct SynthesisCounters {
    pub started: AtomicUsize,
    pub completed: AtomicUsize,
    pub released: AtomicUsize,
}

impl SynthesisCounters {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct ReleaseGuard(Arc<SynthesisCounters>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSynthesizer {
    /// Frames per utterance
    pub frames: usize,
    /// Delay before each frame is produced
    pub frame_delay: Duration,
    pub counters: Arc<SynthesisCounters>,
    pub texts: Mutex<Vec<String>>,
}

impl FakeSynthesizer {
    pub fn new(frames: usize, frame_delay: Duration) -> Self {
        Self {
            frames,
            frame_delay,
            counters: Arc::new(SynthesisCounters::default()),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    fn name(&self) -> &str {
        "fake-synthesizer"
    }

    async fn synthesize(&self, text: &str, _voice: &str) -> Result<SynthesisStream, ProviderError> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(text.to_string());

        let guard = ReleaseGuard(Arc::clone(&self.counters));
        let (total, delay) = (self.frames, self.frame_delay);
        let stream = futures::stream::unfold((0usize, guard), move |(n, guard)| async move {
            if n == total {
                guard.0.completed.fetch_add(1, Ordering::SeqCst);
                return None;
            }
            tokio::time::sleep(delay).await;
            Some((Ok(silence_frame(n as u64 * FRAME_MS)), (n + 1, guard)))
        });
        Ok(Box::pin(stream))
    }
}

/// Hands every session the same fake providers
pub struct FakeProviderFactory {
    pub recognizer: Arc<FakeRecognizer>,
    pub reasoner: Arc<FakeReasoner>,
    pub synthesizer: Arc<FakeSynthesizer>,
}

impl FakeProviderFactory {
    pub fn new(recognizer: FakeRecognizer, reasoner: FakeReasoner, synthesizer: FakeSynthesizer) -> Self {
        Self {
            recognizer: Arc::new(recognizer),
            reasoner: Arc::new(reasoner),
            synthesizer: Arc::new(synthesizer),
        }
    }

    /// "hello" -> "Hi there!", 10 frames of 20ms speech
    pub fn conversational() -> Self {
        Self::new(
            FakeRecognizer::replying("hello"),
            FakeReasoner::replying("Hi there!"),
            FakeSynthesizer::new(10, Duration::from_millis(FRAME_MS)),
        )
    }
}

impl ProviderFactory for FakeProviderFactory {
    fn recognizer(&self, _provider: RecognitionProvider) -> Result<Arc<dyn Recognizer>, ProviderError> {
        Ok(self.recognizer.clone())
    }

    fn reasoner(
        &self,
        _provider: ReasoningProvider,
        _model: &str,
    ) -> Result<Arc<dyn Reasoner>, ProviderError> {
        Ok(self.reasoner.clone())
    }

    fn synthesizer(&self, _provider: SynthesisProvider) -> Result<Arc<dyn Synthesizer>, ProviderError> {
        Ok(self.synthesizer.clone())
    }
}

// ============================================================================
// Outbound sink
// ============================================================================

#[derive(Default)]
pub struct SinkCounters {
    pub frames: AtomicUsize,
    pub clears: AtomicUsize,
}

/// AudioSink that only counts
pub struct CountingSink(pub Arc<SinkCounters>);

#[async_trait]
impl AudioSink for CountingSink {
    async fn capture_frame(&mut self, _frame: AudioFrame) -> Result<(), TransportError> {
        self.0.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear_queue(&mut self) {
        self.0.clears.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Events
// ============================================================================

/// Wait for the first event matching `pred`, failing after `within`
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    within: Duration,
    mut pred: F,
) -> Option<SessionEvent>
where
    F: FnMut(&SessionEventKind) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event.kind) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Drain everything already queued
pub fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

/// `to` side of every state change, in order
pub fn state_path(kinds: &[SessionEventKind]) -> Vec<TurnState> {
    kinds
        .iter()
        .filter_map(|kind| match kind {
            SessionEventKind::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::audio::{MixMode, MixerConfig, VadConfig};
use crate::error::StartError;
use crate::pipeline::{PipelineConfig, StageTimeouts};
use crate::providers::{ReasoningProvider, RecognitionProvider, SynthesisProvider};

const ONE_TO_ONE_PROMPT: &str = "You are a helpful and friendly voice assistant. \
Keep your responses concise and natural for voice conversation. \
Avoid long-winded explanations unless specifically asked. \
If you don't know something, be honest about it.";

const CONFERENCE_PROMPT: &str = "You are a helpful and friendly voice assistant in a group conversation. \
You are listening to multiple participants at once and hear them as one mixed stream, \
so you cannot tell who said what. \
Keep your responses concise and natural for voice conversation. \
Address the group as a whole. \
If you're unsure who said something, it's okay to ask for clarification. \
Avoid long-winded explanations unless specifically asked.";

const ONE_TO_ONE_GREETING: &str = "Hello! I'm your AI voice assistant. How can I help you today?";

const CONFERENCE_GREETING: &str =
    "Hello everyone! I'm your AI voice assistant. How can I help the group today?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// One remote participant, audio passed straight through
    OneToOne,
    /// Any number of participants, audio downmixed
    Conference,
}

impl SessionMode {
    pub fn default_prompt(self) -> &'static str {
        match self {
            SessionMode::OneToOne => ONE_TO_ONE_PROMPT,
            SessionMode::Conference => CONFERENCE_PROMPT,
        }
    }

    pub fn default_greeting(self) -> &'static str {
        match self {
            SessionMode::OneToOne => ONE_TO_ONE_GREETING,
            SessionMode::Conference => CONFERENCE_GREETING,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Session start request as received from the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub room_name: String,
    pub mode: SessionMode,
    pub recognition_provider: RecognitionProvider,
    pub reasoning_provider: ReasoningProvider,
    #[serde(default)]
    pub reasoning_model: Option<String>,
    pub synthesis_provider: SynthesisProvider,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default = "default_true")]
    pub interruptions_enabled: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// `""` disables the greeting; absent uses the mode's default
    #[serde(default)]
    pub greeting_message: Option<String>,
    /// Remote identity for 1:1 sessions; the first publisher is used if absent
    #[serde(default)]
    pub participant_identity: Option<String>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub watchdog_ms: Option<u64>,
}

impl SessionRequest {
    pub fn new(
        room_name: impl Into<String>,
        mode: SessionMode,
        recognition_provider: RecognitionProvider,
        reasoning_provider: ReasoningProvider,
        synthesis_provider: SynthesisProvider,
    ) -> Self {
        Self {
            room_name: room_name.into(),
            mode,
            recognition_provider,
            reasoning_provider,
            reasoning_model: None,
            synthesis_provider,
            voice_id: None,
            interruptions_enabled: true,
            system_prompt: None,
            greeting_message: None,
            participant_identity: None,
            idle_timeout_secs: None,
            watchdog_ms: None,
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_watchdog_ms() -> u64 {
    2000
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_recognition_timeout_ms() -> u64 {
    10_000
}

fn default_reasoning_timeout_ms() -> u64 {
    15_000
}

fn default_synthesis_timeout_ms() -> u64 {
    10_000
}

fn default_interruption_min_speech_ms() -> u64 {
    300
}

fn default_max_history() -> usize {
    20
}

fn default_reasoning_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_voice_id() -> String {
    "alloy".to_string()
}

fn default_fallback_message() -> String {
    "Sorry, I'm having trouble answering right now. Could you say that again?".to_string()
}

fn default_greet() -> bool {
    true
}

/// Service-wide defaults for every per-session knob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Default: 300 seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Mixer stall watchdog. Default: 2000 ms
    #[serde(default = "default_watchdog_ms")]
    pub watchdog_ms: u64,

    /// How long `stop` waits for the session to release before forcing it
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    #[serde(default = "default_recognition_timeout_ms")]
    pub recognition_timeout_ms: u64,

    #[serde(default = "default_reasoning_timeout_ms")]
    pub reasoning_timeout_ms: u64,

    #[serde(default = "default_synthesis_timeout_ms")]
    pub synthesis_timeout_ms: u64,

    /// Speech needed while the agent is busy to count as barge-in
    #[serde(default = "default_interruption_min_speech_ms")]
    pub interruption_min_speech_ms: u64,

    #[serde(default = "default_max_history")]
    pub max_history: usize,

    #[serde(default = "default_reasoning_model")]
    pub reasoning_model: String,

    #[serde(default = "default_voice_id")]
    pub voice_id: String,

    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Greet when the request does not say otherwise
    #[serde(default = "default_greet")]
    pub greet: bool,

    #[serde(default)]
    pub vad: VadConfig,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            watchdog_ms: default_watchdog_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            recognition_timeout_ms: default_recognition_timeout_ms(),
            reasoning_timeout_ms: default_reasoning_timeout_ms(),
            synthesis_timeout_ms: default_synthesis_timeout_ms(),
            interruption_min_speech_ms: default_interruption_min_speech_ms(),
            max_history: default_max_history(),
            reasoning_model: default_reasoning_model(),
            voice_id: default_voice_id(),
            fallback_message: default_fallback_message(),
            greet: default_greet(),
            vad: VadConfig::default(),
        }
    }
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_slice_ms() -> u64 {
    20
}

fn default_max_buffer_ms() -> u64 {
    200
}

/// Inbound audio format and mixer slicing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Recognition input rate. Default: 16000 Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    /// Mixer slice length. Default: 20 ms
    #[serde(default = "default_slice_ms")]
    pub slice_ms: u64,

    /// Per-source buffer cap; older samples are dropped beyond it
    #[serde(default = "default_max_buffer_ms")]
    pub max_buffer_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            slice_ms: default_slice_ms(),
            max_buffer_ms: default_max_buffer_ms(),
        }
    }
}

/// Everything one session runs with, fixed at start
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: Uuid,
    pub room_name: String,
    pub mode: SessionMode,
    pub recognition_provider: RecognitionProvider,
    pub reasoning_provider: ReasoningProvider,
    pub reasoning_model: String,
    pub synthesis_provider: SynthesisProvider,
    pub voice_id: String,
    pub interruptions_enabled: bool,
    pub interruption_min_speech_ms: u64,
    pub system_prompt: String,
    pub greeting: Option<String>,
    pub fallback_message: String,
    pub participant_identity: Option<String>,
    pub idle_timeout: Duration,
    pub stop_grace: Duration,
    pub timeouts: StageTimeouts,
    pub vad: VadConfig,
    pub max_history: usize,
    pub mixer: MixerConfig,
}

impl SessionConfig {
    /// Merge a start request with service defaults, rejecting unusable values
    pub fn resolve(
        session_id: Uuid,
        request: &SessionRequest,
        defaults: &SessionDefaults,
        audio: &AudioSettings,
    ) -> Result<Self, StartError> {
        let room_name = request.room_name.trim();
        if room_name.is_empty() {
            return Err(StartError::InvalidConfig("roomName must not be empty".to_string()));
        }
        if room_name.len() > 128 || room_name.chars().any(|c| c.is_control()) {
            return Err(StartError::InvalidConfig(format!(
                "roomName '{}' is not a valid room name",
                room_name
            )));
        }

        let idle_secs = request.idle_timeout_secs.unwrap_or(defaults.idle_timeout_secs);
        if idle_secs == 0 {
            return Err(StartError::InvalidConfig(
                "idleTimeoutSecs must be positive".to_string(),
            ));
        }
        let watchdog_ms = request.watchdog_ms.unwrap_or(defaults.watchdog_ms);
        if watchdog_ms == 0 {
            return Err(StartError::InvalidConfig("watchdogMs must be positive".to_string()));
        }
        if audio.sample_rate == 0 || audio.channels == 0 || audio.slice_ms == 0 {
            return Err(StartError::InvalidConfig(
                "audio sample_rate, channels and slice_ms must be positive".to_string(),
            ));
        }

        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let greeting = match &request.greeting_message {
            Some(text) if text.trim().is_empty() => None,
            Some(text) => Some(text.trim().to_string()),
            None if defaults.greet => Some(request.mode.default_greeting().to_string()),
            None => None,
        };

        let mixer = MixerConfig {
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            slice_ms: audio.slice_ms,
            watchdog: Duration::from_millis(watchdog_ms),
            max_buffer_ms: audio.max_buffer_ms.max(audio.slice_ms),
            mode: match request.mode {
                SessionMode::OneToOne => MixMode::PassThrough,
                SessionMode::Conference => MixMode::Summing,
            },
        };

        Ok(Self {
            session_id,
            room_name: room_name.to_string(),
            mode: request.mode,
            recognition_provider: request.recognition_provider,
            reasoning_provider: request.reasoning_provider,
            reasoning_model: non_empty(&request.reasoning_model)
                .unwrap_or_else(|| defaults.reasoning_model.clone()),
            synthesis_provider: request.synthesis_provider,
            voice_id: non_empty(&request.voice_id).unwrap_or_else(|| defaults.voice_id.clone()),
            interruptions_enabled: request.interruptions_enabled,
            interruption_min_speech_ms: defaults.interruption_min_speech_ms,
            system_prompt: non_empty(&request.system_prompt)
                .unwrap_or_else(|| request.mode.default_prompt().to_string()),
            greeting,
            fallback_message: defaults.fallback_message.clone(),
            participant_identity: non_empty(&request.participant_identity),
            idle_timeout: Duration::from_secs(idle_secs),
            stop_grace: Duration::from_millis(defaults.stop_grace_ms),
            timeouts: StageTimeouts {
                recognition: Duration::from_millis(defaults.recognition_timeout_ms),
                reasoning: Duration::from_millis(defaults.reasoning_timeout_ms),
                synthesis: Duration::from_millis(defaults.synthesis_timeout_ms),
            },
            vad: defaults.vad.clone(),
            max_history: defaults.max_history,
            mixer,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            interruptions_enabled: self.interruptions_enabled,
            interruption_min_speech_ms: self.interruption_min_speech_ms,
            system_prompt: self.system_prompt.clone(),
            greeting: self.greeting.clone(),
            voice_id: self.voice_id.clone(),
            fallback_message: self.fallback_message.clone(),
            idle_timeout: self.idle_timeout,
            timeouts: self.timeouts.clone(),
            vad: self.vad.clone(),
            max_history: self.max_history,
        }
    }
}

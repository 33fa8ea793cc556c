//! OpenAI-compatible REST client
//!
//! Covers Whisper transcription, chat completions and streamed speech. Groq
//! exposes the same API surface under a different base URL, so both providers
//! share this client.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use super::{ensure_success, ChatMessage, Reasoner, Recognizer, SynthesisStream, Synthesizer};
use crate::audio::{encode_wav, AudioFrame, PcmFramer, Utterance};
use crate::error::ProviderError;

/// Sample rate of `response_format: pcm` speech output
pub const SPEECH_SAMPLE_RATE: u32 = 24_000;
/// Frame size the speech byte stream is cut into
pub const SPEECH_FRAME_MS: u64 = 20;

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SPEECH_MODEL: &str = "tts-1";

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    provider: &'static str,
    base_url: String,
    api_key: String,
    transcription_model: String,
    chat_model: String,
    speech_model: String,
    language: Option<String>,
}

impl OpenAiClient {
    pub fn openai(http: Client, base_url: &str, api_key: &str) -> Self {
        Self::with_provider(http, "openai", base_url, api_key, "whisper-1")
    }

    pub fn groq(http: Client, base_url: &str, api_key: &str) -> Self {
        Self::with_provider(http, "groq", base_url, api_key, "whisper-large-v3")
    }

    fn with_provider(
        http: Client,
        provider: &'static str,
        base_url: &str,
        api_key: &str,
        transcription_model: &str,
    ) -> Self {
        Self {
            http,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            transcription_model: transcription_model.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            speech_model: DEFAULT_SPEECH_MODEL.to_string(),
            language: None,
        }
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

#[async_trait]
impl Recognizer for OpenAiClient {
    fn name(&self) -> &str {
        self.provider
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, ProviderError> {
        let wav = encode_wav(&utterance.samples, utterance.sample_rate, utterance.channels)
            .map_err(|e| ProviderError::Encoding(e.to_string()))?;

        let file = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let mut form = Form::new()
            .text("model", self.transcription_model.clone())
            .text("response_format", "json")
            .part("file", file);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .http
            .post(self.endpoint("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let response = ensure_success(self.provider, response).await?;

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        debug!(
            "{} transcribed {}ms of audio: {} chars",
            self.provider,
            utterance.duration_ms(),
            parsed.text.len()
        );
        Ok(parsed.text.trim().to_string())
    }
}

#[async_trait]
impl Reasoner for OpenAiClient {
    fn name(&self) -> &str {
        self.provider
    }

    async fn respond(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);

        let request = ChatRequest {
            model: &self.chat_model,
            messages,
        };
        let response = self
            .http
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(self.provider, response).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("empty completion".to_string()))
    }
}

#[async_trait]
impl Synthesizer for OpenAiClient {
    fn name(&self) -> &str {
        self.provider
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesisStream, ProviderError> {
        let request = SpeechRequest {
            model: &self.speech_model,
            input: text,
            voice,
            response_format: "pcm",
        };
        let response = self
            .http
            .post(self.endpoint("audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let response = ensure_success(self.provider, response).await?;

        Ok(pcm_frames(
            Box::pin(response.bytes_stream()),
            SPEECH_SAMPLE_RATE,
            1,
            SPEECH_FRAME_MS,
        ))
    }
}

struct FramingState<S> {
    body: S,
    framer: PcmFramer,
    ready: VecDeque<AudioFrame>,
    done: bool,
}

/// Cut a raw little-endian PCM byte stream into fixed-duration frames.
///
/// A transport error ends the stream after being yielded once.
pub(crate) fn pcm_frames<S, B, E>(
    body: S,
    sample_rate: u32,
    channels: u16,
    frame_ms: u64,
) -> SynthesisStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    let state = FramingState {
        body,
        framer: PcmFramer::new(sample_rate, channels, frame_ms),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.ready.extend(state.framer.push(chunk.as_ref())),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.framer.flush());
                }
            }
        }
    }))
}

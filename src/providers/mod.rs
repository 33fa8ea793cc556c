//! Recognition, reasoning and synthesis providers
//!
//! The turn pipeline depends only on the three capability traits below; one
//! implementation exists per provider. `HttpProviderFactory` builds them from
//! configured credentials at session start.

mod deepgram;
mod openai;

pub use deepgram::DeepgramRecognizer;
pub use openai::OpenAiClient;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioFrame, Utterance};
use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionProvider {
    Deepgram,
    #[serde(rename = "openai")]
    OpenAi,
    Groq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Groq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisProvider {
    #[serde(rename = "openai")]
    OpenAi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Synthesized audio, delivered frame by frame as the provider streams it
pub type SynthesisStream = Pin<Box<dyn Stream<Item = Result<AudioFrame, ProviderError>> + Send>>;

/// Speech-to-text
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, ProviderError>;
}

/// Response generation from the conversation so far
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
    ) -> Result<String, ProviderError>;
}

/// Text-to-speech
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str, voice: &str) -> Result<SynthesisStream, ProviderError>;
}

/// Builds provider instances for a session
pub trait ProviderFactory: Send + Sync {
    fn recognizer(&self, provider: RecognitionProvider) -> Result<Arc<dyn Recognizer>, ProviderError>;

    fn reasoner(
        &self,
        provider: ReasoningProvider,
        model: &str,
    ) -> Result<Arc<dyn Reasoner>, ProviderError>;

    fn synthesizer(&self, provider: SynthesisProvider) -> Result<Arc<dyn Synthesizer>, ProviderError>;
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_groq_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_deepgram_base_url() -> String {
    "https://api.deepgram.com/v1".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Provider credentials and endpoints
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default, skip_serializing)]
    pub groq_api_key: Option<String>,
    #[serde(default = "default_groq_base_url")]
    pub groq_base_url: String,
    #[serde(default, skip_serializing)]
    pub deepgram_api_key: Option<String>,
    #[serde(default = "default_deepgram_base_url")]
    pub deepgram_base_url: String,
    /// Recognition language hint
    #[serde(default = "default_language")]
    pub language: String,
    /// Upper bound on any single HTTP request; stage deadlines are usually shorter
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            groq_api_key: None,
            groq_base_url: default_groq_base_url(),
            deepgram_api_key: None,
            deepgram_base_url: default_deepgram_base_url(),
            language: default_language(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("ProviderSettings")
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("groq_api_key", &redact(&self.groq_api_key))
            .field("groq_base_url", &self.groq_base_url)
            .field("deepgram_api_key", &redact(&self.deepgram_api_key))
            .field("deepgram_base_url", &self.deepgram_base_url)
            .field("language", &self.language)
            .finish()
    }
}

/// Builds HTTP-backed providers from configured credentials
pub struct HttpProviderFactory {
    settings: ProviderSettings,
    http: reqwest::Client,
}

impl HttpProviderFactory {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self { settings, http })
    }

    fn openai(&self) -> Result<OpenAiClient, ProviderError> {
        let key = required(&self.settings.openai_api_key, "openai_api_key")?;
        Ok(OpenAiClient::openai(
            self.http.clone(),
            &self.settings.openai_base_url,
            key,
        ))
    }

    fn groq(&self) -> Result<OpenAiClient, ProviderError> {
        let key = required(&self.settings.groq_api_key, "groq_api_key")?;
        Ok(OpenAiClient::groq(
            self.http.clone(),
            &self.settings.groq_base_url,
            key,
        ))
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn recognizer(&self, provider: RecognitionProvider) -> Result<Arc<dyn Recognizer>, ProviderError> {
        let language = self.settings.language.clone();
        Ok(match provider {
            RecognitionProvider::Deepgram => {
                let key = required(&self.settings.deepgram_api_key, "deepgram_api_key")?;
                Arc::new(DeepgramRecognizer::new(
                    self.http.clone(),
                    &self.settings.deepgram_base_url,
                    key,
                    language,
                ))
            }
            RecognitionProvider::OpenAi => Arc::new(self.openai()?.with_language(language)),
            RecognitionProvider::Groq => Arc::new(self.groq()?.with_language(language)),
        })
    }

    fn reasoner(
        &self,
        provider: ReasoningProvider,
        model: &str,
    ) -> Result<Arc<dyn Reasoner>, ProviderError> {
        Ok(match provider {
            ReasoningProvider::OpenAi => Arc::new(self.openai()?.with_chat_model(model)),
            ReasoningProvider::Groq => Arc::new(self.groq()?.with_chat_model(model)),
        })
    }

    fn synthesizer(&self, provider: SynthesisProvider) -> Result<Arc<dyn Synthesizer>, ProviderError> {
        Ok(match provider {
            SynthesisProvider::OpenAi => Arc::new(self.openai()?),
        })
    }
}

/// Map a non-2xx response to `ProviderError::Api`, keeping the body for diagnostics
pub(crate) async fn ensure_success(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ProviderError::Api {
        provider,
        status: status.as_u16(),
        body,
    })
}

fn required<'a>(key: &'a Option<String>, name: &str) -> Result<&'a str, ProviderError> {
    key.as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ProviderError::NotConfigured(format!("{} is not set", name)))
}

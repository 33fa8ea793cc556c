use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{ensure_success, Recognizer};
use crate::audio::{encode_wav, Utterance};
use crate::error::ProviderError;

const PROVIDER: &str = "deepgram";
const MODEL: &str = "nova-2";

/// Deepgram pre-recorded transcription
pub struct DeepgramRecognizer {
    http: Client,
    base_url: String,
    api_key: String,
    language: String,
}

impl DeepgramRecognizer {
    pub fn new(http: Client, base_url: &str, api_key: &str, language: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            language: language.into(),
        }
    }
}

#[derive(Deserialize)]
struct ListenResponse {
    results: ListenResults,
}

#[derive(Deserialize)]
struct ListenResults {
    channels: Vec<ListenChannel>,
}

#[derive(Deserialize)]
struct ListenChannel {
    alternatives: Vec<ListenAlternative>,
}

#[derive(Deserialize)]
struct ListenAlternative {
    transcript: String,
}

fn first_transcript(response: ListenResponse) -> Result<String, ProviderError> {
    response
        .results
        .channels
        .into_iter()
        .next()
        .and_then(|channel| channel.alternatives.into_iter().next())
        .map(|alt| alt.transcript.trim().to_string())
        .ok_or_else(|| ProviderError::InvalidResponse("no transcript alternatives".to_string()))
}

#[async_trait]
impl Recognizer for DeepgramRecognizer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, ProviderError> {
        let wav = encode_wav(&utterance.samples, utterance.sample_rate, utterance.channels)
            .map_err(|e| ProviderError::Encoding(e.to_string()))?;

        let response = self
            .http
            .post(format!("{}/listen", self.base_url))
            .query(&[
                ("model", MODEL),
                ("language", self.language.as_str()),
                ("smart_format", "true"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await?;
        let response = ensure_success(PROVIDER, response).await?;

        let parsed: ListenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let transcript = first_transcript(parsed)?;
        debug!(
            "deepgram transcribed {}ms of audio: {} chars",
            utterance.duration_ms(),
            transcript.len()
        );
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_transcript() {
        let body = r#"{
            "metadata": {"request_id": "abc"},
            "results": {"channels": [{"alternatives": [
                {"transcript": " hello there ", "confidence": 0.98},
                {"transcript": "hello their", "confidence": 0.41}
            ]}]}
        }"#;
        let parsed: ListenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(first_transcript(parsed).unwrap(), "hello there");
    }

    #[test]
    fn test_missing_alternatives_is_invalid() {
        let parsed: ListenResponse =
            serde_json::from_str(r#"{"results": {"channels": []}}"#).unwrap();
        assert!(matches!(
            first_transcript(parsed),
            Err(ProviderError::InvalidResponse(_))
        ));
    }
}

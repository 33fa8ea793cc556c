use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::dispatcher::DispatcherSettings;
use crate::providers::ProviderSettings;
use crate::room::RetryPolicy;
use crate::session::{AudioSettings, SessionDefaults};

/// Prefix for environment overrides, e.g. `LOQA_AGENT__MEDIA__API_SECRET`
pub const ENV_PREFIX: &str = "LOQA_AGENT";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub audio: AudioSettings,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub providers: ProviderSettings,
    #[serde(default)]
    pub nats: Option<NatsConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Deserialize)]
pub struct MediaConfig {
    /// Media server URL handed to clients in the start response
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    /// Lifetime of issued access tokens. Default: 6 hours
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_user_identity_prefix")]
    pub user_identity_prefix: String,
    #[serde(default = "default_agent_identity_prefix")]
    pub agent_identity_prefix: String,
    #[serde(default)]
    pub connect_retry: RetryPolicy,
    /// Per-attempt limit on joining a room. Default: 10 seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl std::fmt::Debug for MediaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("user_identity_prefix", &self.user_identity_prefix)
            .field("agent_identity_prefix", &self.agent_identity_prefix)
            .field("connect_retry", &self.connect_retry)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl MediaConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Final status reports kept for finished sessions
    #[serde(default = "default_finished_records")]
    pub finished_records: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            finished_records: default_finished_records(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_token_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_identity_prefix() -> String {
    "user".to_string()
}

fn default_agent_identity_prefix() -> String {
    "agent".to_string()
}

fn default_max_sessions() -> usize {
    8
}

fn default_finished_records() -> usize {
    256
}

fn default_subject_prefix() -> String {
    "voice".to_string()
}

impl Config {
    /// Load a TOML file (extension optional) and apply `LOQA_AGENT__*`
    /// environment overrides on top
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read config from {}", path))?;

        let config: Self = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.dispatcher.max_sessions == 0 {
            anyhow::bail!("dispatcher.max_sessions must be at least 1");
        }
        if self.media.api_secret.is_empty() {
            anyhow::bail!("media.api_secret must be set");
        }
        if self.media.token_ttl_secs == 0 {
            anyhow::bail!("media.token_ttl_secs must be positive");
        }
        Ok(())
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            max_sessions: self.dispatcher.max_sessions,
            finished_records: self.dispatcher.finished_records,
            user_identity_prefix: self.media.user_identity_prefix.clone(),
            agent_identity_prefix: self.media.agent_identity_prefix.clone(),
            session: self.session.clone(),
            audio: self.audio.clone(),
        }
    }
}

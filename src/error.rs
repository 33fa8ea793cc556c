use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by a media transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket-level failure worth retrying
    #[error("Transient transport failure: {0}")]
    Transient(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Connection closed")]
    Closed,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Room join / transport failure; fatal to the session once surfaced
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Malformed access token: {0}")]
    InvalidToken(String),

    #[error("Access token expired")]
    TokenExpired,

    #[error("Access token not valid yet")]
    TokenNotYetValid,

    #[error("Access token is scoped to room '{granted}', not '{expected}'")]
    RoomMismatch { expected: String, granted: String },

    #[error("Room connection rejected: {0}")]
    Rejected(String),

    #[error("Room connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Disconnected from room: {0}")]
    Disconnected(String),
}

/// Recognition / reasoning / synthesis call failure; always recoverable
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider call cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Audio encoding failed: {0}")]
    Encoding(String),
}

/// Session could not be started
#[derive(Error, Debug)]
pub enum StartError {
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Token issuance failed: {0}")]
    Token(String),
}

/// Dispatcher-level rejection
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Capacity exceeded: {limit} concurrent sessions")]
    CapacityExceeded { limit: usize },

    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Start(#[from] StartError),
}

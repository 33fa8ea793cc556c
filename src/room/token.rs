//! Access-token handling.
//!
//! Tokens are opaque signed credentials issued by an external collaborator.
//! The engine never verifies signatures; it only reads the claims to reject
//! tokens that are malformed, expired, or scoped to another room before a
//! connection attempt is made.

use base64::Engine;
use livekit_api::access_token::{AccessToken, VideoGrants};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::error::{ConnectionError, StartError};

/// Clock skew tolerated on `nbf`
const NOT_BEFORE_LEEWAY_SECS: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct AccessClaims {
    /// Participant identity
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub nbf: Option<i64>,
    #[serde(default)]
    pub video: Option<RoomGrant>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrant {
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub room_join: bool,
}

/// Decode the payload segment of a JWT without verifying it
pub fn decode_claims(token: &str) -> Result<AccessClaims, ConnectionError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(ConnectionError::InvalidToken(
            "expected three dot-separated segments".to_string(),
        ));
    };

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ConnectionError::InvalidToken(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| ConnectionError::InvalidToken(format!("payload is not valid claims: {}", e)))
}

/// Check expiry and room scope; returns the identity the token joins as
pub fn check_claims(
    claims: &AccessClaims,
    room_name: &str,
    now_unix: i64,
) -> Result<String, ConnectionError> {
    let identity = claims
        .sub
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConnectionError::InvalidToken("missing identity (sub)".to_string()))?;

    match claims.exp {
        Some(exp) if exp <= now_unix => return Err(ConnectionError::TokenExpired),
        Some(_) => {}
        None => {
            return Err(ConnectionError::InvalidToken(
                "missing expiry (exp)".to_string(),
            ))
        }
    }

    if let Some(nbf) = claims.nbf {
        if nbf > now_unix + NOT_BEFORE_LEEWAY_SECS {
            return Err(ConnectionError::TokenNotYetValid);
        }
    }

    let grant = claims
        .video
        .as_ref()
        .ok_or_else(|| ConnectionError::InvalidToken("missing room grant".to_string()))?;
    if !grant.room_join {
        return Err(ConnectionError::InvalidToken(
            "grant does not allow joining rooms".to_string(),
        ));
    }
    if !grant.room.is_empty() && grant.room != room_name {
        return Err(ConnectionError::RoomMismatch {
            expected: room_name.to_string(),
            granted: grant.room.clone(),
        });
    }

    Ok(identity.to_string())
}

/// Issues room-scoped access tokens for session participants
pub trait TokenIssuer: Send + Sync {
    fn issue(
        &self,
        room_name: &str,
        identity: &str,
        display_name: &str,
    ) -> Result<String, StartError>;
}

/// Signs LiveKit-format access tokens
#[derive(Clone)]
pub struct LiveKitTokenIssuer {
    api_key: String,
    api_secret: String,
    ttl: Duration,
}

impl LiveKitTokenIssuer {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            ttl,
        }
    }
}

impl fmt::Debug for LiveKitTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitTokenIssuer")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TokenIssuer for LiveKitTokenIssuer {
    fn issue(
        &self,
        room_name: &str,
        identity: &str,
        display_name: &str,
    ) -> Result<String, StartError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(StartError::Token(
                "media server API credentials not configured".to_string(),
            ));
        }

        AccessToken::with_api_key(&self.api_key, &self.api_secret)
            .with_identity(identity)
            .with_name(display_name)
            .with_grants(VideoGrants {
                room_join: true,
                room: room_name.to_string(),
                can_publish: true,
                can_subscribe: true,
                can_publish_data: true,
                ..Default::default()
            })
            .with_ttl(self.ttl)
            .to_jwt()
            .map_err(|e| StartError::Token(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned_token(payload: serde_json::Value) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.sig",
            engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#),
            engine.encode(payload.to_string())
        )
    }

    #[test]
    fn test_valid_claims_yield_identity() {
        let token = unsigned_token(serde_json::json!({
            "sub": "agent-1",
            "exp": 2_000,
            "video": { "room": "sales-call", "roomJoin": true }
        }));

        let claims = decode_claims(&token).unwrap();
        let identity = check_claims(&claims, "sales-call", 1_000).unwrap();
        assert_eq!(identity, "agent-1");
    }

    #[test]
    fn test_expired_token_rejected() {
        let token = unsigned_token(serde_json::json!({
            "sub": "agent-1",
            "exp": 999,
            "video": { "room": "sales-call", "roomJoin": true }
        }));

        let claims = decode_claims(&token).unwrap();
        assert_eq!(
            check_claims(&claims, "sales-call", 1_000),
            Err(ConnectionError::TokenExpired)
        );
    }

    #[test]
    fn test_room_scope_enforced() {
        let token = unsigned_token(serde_json::json!({
            "sub": "agent-1",
            "exp": 2_000,
            "video": { "room": "other-room", "roomJoin": true }
        }));

        let claims = decode_claims(&token).unwrap();
        assert!(matches!(
            check_claims(&claims, "sales-call", 1_000),
            Err(ConnectionError::RoomMismatch { .. })
        ));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(matches!(
            decode_claims("not-a-jwt"),
            Err(ConnectionError::InvalidToken(_))
        ));
        assert!(matches!(
            decode_claims("a.!!!.c"),
            Err(ConnectionError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_issued_token_round_trips_through_claim_checks() {
        let issuer = LiveKitTokenIssuer::new("devkey", "secret", Duration::from_secs(600));
        let token = issuer.issue("sales-call", "user-42", "Customer").unwrap();

        let claims = decode_claims(&token).unwrap();
        let now = chrono::Utc::now().timestamp();
        assert_eq!(check_claims(&claims, "sales-call", now).unwrap(), "user-42");
        assert_eq!(claims.name.as_deref(), Some("Customer"));
    }

    #[test]
    fn test_issuer_requires_credentials() {
        let issuer = LiveKitTokenIssuer::new("", "", Duration::from_secs(600));
        assert!(issuer.issue("room", "id", "name").is_err());
    }
}

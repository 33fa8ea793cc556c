// Integration tests for room connection against the in-process room server

use anyhow::Result;
use base64::Engine;
use loqa_voice_agent::room::{
    LiveKitSettings, LiveKitTokenIssuer, LiveKitTransport, LocalRoomServer, RetryPolicy,
    RoomConnector, RoomEvent, SubscriptionPolicy, TokenIssuer,
};
use loqa_voice_agent::{ConnectionError, TransportError};
use std::sync::Arc;
use std::time::Duration;

fn issuer() -> LiveKitTokenIssuer {
    LiveKitTokenIssuer::new("devkey", "secret", Duration::from_secs(3600))
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 5,
    }
}

/// Collect events until the feed goes quiet
async fn settle(events: &mut loqa_voice_agent::room::RoomEvents) -> Vec<RoomEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(100), events.next_event()).await
    {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_connect_joins_as_token_identity() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;

    let handle = connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await?;

    assert_eq!(handle.local_identity, "agent-1");
    assert_eq!(handle.room_name, "demo");
    assert!(server.room("demo").is_connected("agent-1"));
    assert_eq!(server.connect_attempts(), 1);

    Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    server.fail_next_connects([
        TransportError::Transient("signal timeout".to_string()),
        TransportError::Transient("ice failed".to_string()),
    ]);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;

    connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await?;
    assert_eq!(server.connect_attempts(), 3);

    Ok(())
}

#[tokio::test]
async fn test_retries_are_bounded() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    server.fail_next_connects(
        (0..5).map(|i| TransportError::Transient(format!("attempt {}", i))),
    );
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;

    let result = connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await;

    assert!(matches!(
        result,
        Err(ConnectionError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(server.connect_attempts(), 3);

    Ok(())
}

#[tokio::test]
async fn test_rejection_is_not_retried() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    server.fail_next_connects([TransportError::Rejected("room full".to_string())]);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;

    let result = connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await;

    assert!(matches!(result, Err(ConnectionError::Rejected(_))));
    assert_eq!(server.connect_attempts(), 1);

    Ok(())
}

#[tokio::test]
async fn test_token_scope_checked_before_connecting() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());

    let other_room = issuer().issue("other-room", "agent-1", "AI Agent")?;
    let result = connector
        .connect(&other_room, "demo", SubscriptionPolicy::AllTracks)
        .await;
    assert!(matches!(result, Err(ConnectionError::RoomMismatch { .. })));

    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let expired = format!(
        "{}.{}.sig",
        engine.encode(br#"{"alg":"HS256"}"#),
        engine.encode(
            serde_json::json!({
                "sub": "agent-1",
                "exp": 1,
                "video": { "room": "demo", "roomJoin": true }
            })
            .to_string()
        )
    );
    let result = connector
        .connect(&expired, "demo", SubscriptionPolicy::AllTracks)
        .await;
    assert!(matches!(result, Err(ConnectionError::TokenExpired)));

    assert!(matches!(
        connector
            .connect("garbage", "demo", SubscriptionPolicy::AllTracks)
            .await,
        Err(ConnectionError::InvalidToken(_))
    ));
    assert_eq!(server.connect_attempts(), 0);

    Ok(())
}

#[tokio::test]
async fn test_audio_only_policy_subscribes_one_participant() -> Result<()> {
    // Setup: the expected user and an extra participant are already publishing
    let server = LocalRoomServer::with_pacing(false);
    let room = server.room("demo");
    let user = room.join("user-1");
    let _user_track = user.publish_audio();
    let intruder = room.join("intruder");
    let _intruder_track = intruder.publish_audio();

    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;
    let handle = connector
        .connect(
            &token,
            "demo",
            SubscriptionPolicy::AudioOnly {
                participant: Some("user-1".to_string()),
            },
        )
        .await?;
    let (_connection, mut events) = handle.into_parts();

    let seen = settle(&mut events).await;
    let subscribed: Vec<String> = seen
        .iter()
        .filter_map(|e| match e {
            RoomEvent::TrackSubscribed { stream } => Some(stream.identity().to_string()),
            _ => None,
        })
        .collect();

    // Verify: only the expected participant's audio reaches the session
    assert_eq!(subscribed, vec!["user-1".to_string()]);
    assert_eq!(room.subscriber_count("user-1"), 1);
    assert_eq!(room.subscriber_count("intruder"), 0);

    Ok(())
}

#[tokio::test]
async fn test_audio_only_binds_first_publisher() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;
    let handle = connector
        .connect(&token, "demo", SubscriptionPolicy::AudioOnly { participant: None })
        .await?;
    let (_connection, mut events) = handle.into_parts();

    let room = server.room("demo");
    let first = room.join("first");
    let _t1 = first.publish_audio();
    let second = room.join("second");
    let _t2 = second.publish_audio();

    settle(&mut events).await;
    assert_eq!(events.target(), Some("first"));
    assert_eq!(room.subscriber_count("first"), 1);
    assert_eq!(room.subscriber_count("second"), 0);

    Ok(())
}

#[tokio::test]
async fn test_remote_close_surfaces_disconnect_once() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    let connector = Arc::new(RoomConnector::new(server.clone(), "ws://local", fast_retry()));
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;
    let handle = connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await?;
    let (connection, mut events) = handle.into_parts();

    server.room("demo").close("server shutting down");

    let event = events.next_event().await;
    assert!(matches!(
        event,
        Some(RoomEvent::Disconnected { reason }) if reason == "server shutting down"
    ));
    assert!(events.next_event().await.is_none());
    assert!(connection.disconnect().await.is_ok());

    Ok(())
}

#[tokio::test]
async fn test_room_is_released_after_last_disconnect() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let first_token = issuer().issue("demo", "agent-1", "AI Agent")?;
    let second_token = issuer().issue("demo", "agent-2", "AI Agent")?;
    let first = connector
        .connect(&first_token, "demo", SubscriptionPolicy::AllTracks)
        .await?;
    let second = connector
        .connect(&second_token, "demo", SubscriptionPolicy::AllTracks)
        .await?;
    let (first, _first_events) = first.into_parts();
    let (second, _second_events) = second.into_parts();

    // Verify: the room outlives one departure, not the last
    first.disconnect().await?;
    assert!(server.has_room("demo"));
    second.disconnect().await?;
    assert!(!server.has_room("demo"));
    assert_eq!(server.room_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_dropped_connection_releases_closed_room() -> Result<()> {
    let server = LocalRoomServer::with_pacing(false);
    let connector = RoomConnector::new(server.clone(), "ws://local", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;
    let handle = connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await?;

    server.room("demo").close("server shutting down");
    assert!(server.has_room("demo"));
    drop(handle);

    assert_eq!(server.room_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_unreachable_media_server_fails_to_connect() -> Result<()> {
    // Nothing listens on port 1
    let transport = LiveKitTransport::new(LiveKitSettings {
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    let connector = RoomConnector::new(transport, "ws://127.0.0.1:1", fast_retry());
    let token = issuer().issue("demo", "agent-1", "AI Agent")?;

    let result = connector
        .connect(&token, "demo", SubscriptionPolicy::AllTracks)
        .await;

    assert!(matches!(
        result,
        Err(ConnectionError::RetriesExhausted { attempts: 3, .. })
            | Err(ConnectionError::Rejected(_))
    ));

    Ok(())
}

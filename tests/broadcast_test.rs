use std::time::Duration;

use switchyard::config::GatewayConfig;
use switchyard::core::message::BroadcastTarget;
use switchyard::core::server::GatewayManager;
use switchyard::core::session::OutboundQueue;
use switchyard::error::GatewayError;

async fn drain(queue: &OutboundQueue) -> Vec<String> {
    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(50), queue.pop()).await {
            Ok(Some(frame)) => frames.push(frame.to_str().unwrap_or_default().to_string()),
            _ => break,
        }
    }
    frames
}

#[tokio::test]
async fn test_channel_broadcast_exactly_once_per_member() {
    let gateway = GatewayManager::new(GatewayConfig::for_testing()).unwrap();

    let mut members = Vec::new();
    for _ in 0..5 {
        let session = gateway
            .handshake(None, "acme".to_string(), None)
            .await
            .unwrap();
        gateway
            .channels()
            .subscribe(&session.session_id, "acme", "news")
            .await
            .unwrap();
        members.push(session);
    }
    let outsider = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();

    let delivered = gateway
        .broadcast_to_channel("news", serde_json::json!({"body": "hello"}))
        .await
        .unwrap();
    assert_eq!(delivered, 5);

    for member in &members {
        let frames = drain(&member.queue).await;
        assert_eq!(frames.len(), 1, "each member receives exactly once");
        assert!(frames[0].contains("\"body\":\"hello\""));
    }
    assert!(drain(&outsider.queue).await.is_empty(), "non-members get nothing");
}

#[tokio::test]
async fn test_user_scope_hits_all_of_that_users_sessions() {
    let mut config = GatewayConfig::for_testing();
    config.auth_enabled = true;
    let gateway = GatewayManager::new(config.clone()).unwrap();

    let tokens = switchyard::auth::TokenManager::new(
        config.jwt_secret.as_deref().unwrap(),
        Duration::from_secs(30),
    );
    let token = tokens
        .generate_token(&switchyard::auth::Claims::new("alice".to_string(), None))
        .unwrap();

    let first = gateway
        .handshake(None, "acme".to_string(), Some(&token))
        .await
        .unwrap();
    let second = gateway
        .handshake(None, "acme".to_string(), Some(&token))
        .await
        .unwrap();
    let other = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();

    let delivered = gateway
        .broadcast_to_user("alice", serde_json::json!({"ping": true}))
        .await
        .unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(drain(&first.queue).await.len(), 1);
    assert_eq!(drain(&second.queue).await.len(), 1);
    assert!(drain(&other.queue).await.is_empty());
}

#[tokio::test]
async fn test_broadcast_after_terminate_misses_removed_session() {
    let gateway = GatewayManager::new(GatewayConfig::for_testing()).unwrap();
    let stays = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();
    let leaves = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();

    for session in [&stays, &leaves] {
        gateway
            .channels()
            .subscribe(&session.session_id, "acme", "news")
            .await
            .unwrap();
    }

    gateway.terminate_session(&leaves.session_id, "test").await;
    assert!(
        !gateway
            .channels()
            .is_member("news", &leaves.session_id)
            .await
    );

    let delivered = gateway
        .broadcast_to_channel("news", serde_json::json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(drain(&stays.queue).await.len(), 1);
}

#[tokio::test]
async fn test_confirmed_broadcast_signals_no_eligible_targets() {
    let gateway = GatewayManager::new(GatewayConfig::for_testing()).unwrap();
    let err = gateway
        .broadcast_confirmed(
            BroadcastTarget::Channel("nobody".to_string()),
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NoEligibleTargets));

    // Best-effort broadcast stays quiet about it
    let delivered = gateway
        .broadcast_to_channel("nobody", serde_json::json!({}))
        .await
        .unwrap();
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn test_broadcast_to_all_reaches_every_local_session() {
    let gateway = GatewayManager::new(GatewayConfig::for_testing()).unwrap();
    let a = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();
    let b = gateway
        .handshake(None, "globex".to_string(), None)
        .await
        .unwrap();

    let delivered = gateway
        .broadcast_to_all(serde_json::json!({"note": "maintenance at midnight"}))
        .await
        .unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(drain(&a.queue).await.len(), 1);
    assert_eq!(drain(&b.queue).await.len(), 1);
}

#[tokio::test]
async fn test_one_dead_target_does_not_abort_fanout() {
    let gateway = GatewayManager::new(GatewayConfig::for_testing()).unwrap();
    let alive = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();
    let dead = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();

    for session in [&alive, &dead] {
        gateway
            .channels()
            .subscribe(&session.session_id, "acme", "news")
            .await
            .unwrap();
    }

    // Simulate a transport already gone: close the queue but leave the
    // membership in place until the cascade runs
    dead.queue.close();

    let delivered = gateway
        .broadcast_to_channel("news", serde_json::json!({"n": 1}))
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(drain(&alive.queue).await.len(), 1);

    let stats = gateway.get_stats().await;
    assert!(stats.counters.delivery_failures >= 1);
}

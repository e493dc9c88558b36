use std::time::Duration;

use switchyard::auth::{Claims, TokenManager};
use switchyard::config::GatewayConfig;
use switchyard::core::server::GatewayManager;
use switchyard::error::GatewayError;

fn auth_config(require_token: bool) -> GatewayConfig {
    let mut config = GatewayConfig::for_testing();
    config.auth_enabled = true;
    config.require_token = require_token;
    config
}

fn token_manager(config: &GatewayConfig) -> TokenManager {
    TokenManager::new(
        config.jwt_secret.as_deref().unwrap(),
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn test_anonymous_handshake_rejected_before_any_state_exists() {
    let config = auth_config(true);
    let gateway = GatewayManager::new(config).unwrap();

    let err = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthenticated(_)));

    // Rejected before any session or channel was created
    let stats = gateway.get_stats().await;
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.channel_count, 0);
}

#[tokio::test]
async fn test_invalid_token_rejected_when_required() {
    let config = auth_config(true);
    let gateway = GatewayManager::new(config).unwrap();

    let err = gateway
        .handshake(None, "acme".to_string(), Some("garbage-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthenticated(_)));
    assert_eq!(gateway.get_stats().await.active_sessions, 0);
}

#[tokio::test]
async fn test_valid_token_binds_identity_at_handshake() {
    let config = auth_config(true);
    let tokens = token_manager(&config);
    let gateway = GatewayManager::new(config).unwrap();

    let claims = Claims::with_grants(
        "alice".to_string(),
        Some("acme".to_string()),
        vec!["operator".to_string()],
        vec![],
    );
    let token = tokens.generate_token(&claims).unwrap();

    let session = gateway
        .handshake(None, "acme".to_string(), Some(&token))
        .await
        .unwrap();
    assert!(gateway.sessions().is_authenticated(&session.session_id).await);
}

#[tokio::test]
async fn test_token_tenant_must_match_connection_tenant() {
    let config = auth_config(true);
    let tokens = token_manager(&config);
    let gateway = GatewayManager::new(config).unwrap();

    let claims = Claims::new("alice".to_string(), Some("globex".to_string()));
    let token = tokens.generate_token(&claims).unwrap();

    let err = gateway
        .handshake(None, "acme".to_string(), Some(&token))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthorized(_)));
    assert_eq!(gateway.get_stats().await.active_sessions, 0);
}

#[tokio::test]
async fn test_optional_token_fails_soft_to_anonymous() {
    let config = auth_config(false);
    let gateway = GatewayManager::new(config).unwrap();

    let session = gateway
        .handshake(None, "acme".to_string(), Some("garbage-token"))
        .await
        .unwrap();
    assert!(!gateway.sessions().is_authenticated(&session.session_id).await);
    assert!(gateway.get_stats().await.counters.auth_failures >= 1);
}

#[tokio::test]
async fn test_post_handshake_auth_frame_promotes_session() {
    let config = auth_config(false);
    let tokens = token_manager(&config);
    let gateway = GatewayManager::new(config).unwrap();

    let session = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();
    assert!(!gateway.sessions().is_authenticated(&session.session_id).await);

    let token = tokens
        .generate_token(&Claims::new("alice".to_string(), None))
        .unwrap();
    let context = gateway
        .authenticate_session(&session.session_id, &token)
        .await
        .unwrap();
    assert_eq!(context.user_id, "alice");
    assert!(gateway.sessions().is_authenticated(&session.session_id).await);
}

#[tokio::test]
async fn test_auth_attempt_limit_terminates_session() {
    let mut config = auth_config(false);
    config.max_auth_attempts = 2;
    let gateway = GatewayManager::new(config).unwrap();

    let session = gateway
        .handshake(None, "acme".to_string(), None)
        .await
        .unwrap();

    // First failure: session survives
    assert!(gateway
        .authenticate_session(&session.session_id, "bad-1")
        .await
        .is_err());
    assert!(gateway.sessions().contains(&session.session_id).await);

    // Second failure crosses the limit
    assert!(gateway
        .authenticate_session(&session.session_id, "bad-2")
        .await
        .is_err());
    assert!(!gateway.sessions().contains(&session.session_id).await);
    assert!(session.queue.is_closed());
}

#[tokio::test]
async fn test_expired_token_is_unauthenticated() {
    let config = auth_config(true);
    let tokens = token_manager(&config);
    let gateway = GatewayManager::new(config).unwrap();

    let mut claims = Claims::new("alice".to_string(), None);
    claims.iat -= 7200;
    claims.nbf = claims.iat;
    claims.exp = claims.iat + 3600;
    let token = tokens.generate_token(&claims).unwrap();

    let err = gateway
        .handshake(None, "acme".to_string(), Some(&token))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Unauthenticated(_)));
}

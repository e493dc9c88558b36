//! Integrated gateway service coordinating all components
//!
//! One `GatewayManager` per process: it owns the session registry, channel
//! namespace, broadcast fan-out, rate limiting, auth and the scaling
//! backend, and exposes the operations collaborators call.

use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::interval;
use uuid::Uuid;

use crate::auth::{AuthContext, AuthMiddleware, LocalTokenVerifier, TokenVerifier};
use crate::config::{BackendType, GatewayConfig};
use crate::core::broadcast::BroadcastManager;
use crate::core::channel::ChannelManager;
use crate::core::message::{BroadcastTarget, ClientFrame, ServerFrame};
use crate::core::rate_limiter::{ConnectionCaps, RateLimiter};
use crate::core::router::{FrameHandler, MessageRouter};
use crate::core::session::{RegisteredSession, SessionManager};
use crate::error::{GatewayError, Result};
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::scaling::{BackendHealth, DistributedBackend, LocalBackend, RedisBus, ScalingBackend};

/// Health summary for the `/health` route and `health_check()`
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "degraded"
    pub status: &'static str,
    pub active_sessions: usize,
    pub backend: &'static str,
    pub backend_health: BackendHealth,
}

/// Counters and gauges for `get_stats()` and the `/stats` route
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub gateway_id: String,
    pub active_sessions: usize,
    pub channel_count: usize,
    pub backend: &'static str,
    pub backend_health: BackendHealth,
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
}

pub struct GatewayManager {
    config: GatewayConfig,
    gateway_id: String,
    sessions: Arc<SessionManager>,
    channels: Arc<ChannelManager>,
    broadcasts: Arc<BroadcastManager>,
    rate_limiter: Arc<RateLimiter>,
    auth: Option<Arc<AuthMiddleware>>,
    backend: Arc<dyn ScalingBackend>,
    router: Arc<MessageRouter>,
    metrics: Arc<GatewayMetrics>,
    draining: AtomicBool,
}

impl GatewayManager {
    /// Build a gateway from configuration, constructing the backend the
    /// config names. Startup-fatal on invalid configuration.
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let gateway_id = format!("gw-{}", Uuid::new_v4());
        let backend: Arc<dyn ScalingBackend> = match config.backend_type {
            BackendType::Local => Arc::new(LocalBackend::new()),
            BackendType::Distributed => {
                let url = config
                    .bus_url
                    .as_deref()
                    .ok_or_else(|| {
                        GatewayError::ConfigError("distributed backend needs a bus URL".to_string())
                    })?;
                Arc::new(DistributedBackend::new(
                    gateway_id.clone(),
                    Arc::new(RedisBus::new(url)),
                ))
            }
        };
        Self::with_backend(config, gateway_id, backend)
    }

    /// Build a gateway around an externally constructed backend. The
    /// backend must have been created with the same `gateway_id` so bus
    /// origin filtering works.
    pub fn with_backend(
        config: GatewayConfig,
        gateway_id: String,
        backend: Arc<dyn ScalingBackend>,
    ) -> Result<Arc<Self>> {
        let verifier: Option<Arc<dyn TokenVerifier>> =
            match (config.auth_enabled, config.jwt_secret.as_deref()) {
                (true, Some(secret)) => Some(Arc::new(LocalTokenVerifier::new(
                    secret,
                    config.clock_skew,
                ))),
                _ => None,
            };
        Self::with_backend_and_verifier(config, gateway_id, backend, verifier)
    }

    /// Full-control constructor: inject a custom `TokenVerifier` (e.g. one
    /// that delegates to an external identity service).
    pub fn with_backend_and_verifier(
        config: GatewayConfig,
        gateway_id: String,
        backend: Arc<dyn ScalingBackend>,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if config.auth_enabled && verifier.is_none() {
            return Err(GatewayError::ConfigError(
                "auth is enabled but no token verifier is available".to_string(),
            ));
        }

        let metrics = Arc::new(GatewayMetrics::new());
        let sessions = Arc::new(SessionManager::new(
            config.outbound_queue_capacity,
            config.overflow_policy,
        ));
        let channels = Arc::new(ChannelManager::new(
            config.tenant_isolation,
            Arc::clone(&backend),
        ));
        let broadcasts = Arc::new(BroadcastManager::new(
            gateway_id.clone(),
            Arc::clone(&sessions),
            Arc::clone(&channels),
            Arc::clone(&backend),
            Arc::clone(&metrics),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_enabled,
            ConnectionCaps {
                max_per_ip: config.max_connections_per_ip,
                max_per_user: config.max_connections_per_user,
                max_per_tenant: config.max_connections_per_tenant,
            },
            config.messages_per_minute,
            config.burst_size,
        ));
        let auth = verifier.map(|v| Arc::new(AuthMiddleware::new(v)));

        Ok(Arc::new(Self {
            config,
            gateway_id,
            sessions,
            channels,
            broadcasts,
            rate_limiter,
            auth,
            backend,
            router: Arc::new(MessageRouter::new()),
            metrics,
            draining: AtomicBool::new(false),
        }))
    }

    /// Start background tasks: bus relay pump, heartbeat eviction sweep,
    /// rate-limit bucket GC.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let (relay_tx, mut relay_rx) = mpsc::channel(1024);
        self.backend.start(relay_tx).await?;

        let broadcasts = Arc::clone(&self.broadcasts);
        tokio::spawn(async move {
            while let Some(message) = relay_rx.recv().await {
                broadcasts.handle_bus_message(message).await;
            }
        });

        let gateway = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = interval(gateway.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                let stale = gateway
                    .sessions
                    .stale_sessions(gateway.config.missed_heartbeat_timeout)
                    .await;
                for session_id in stale {
                    // Routine eviction, not an error
                    log::info!("Evicting session {} after missed heartbeats", session_id);
                    gateway
                        .terminate_session(&session_id, "heartbeat timeout")
                        .await;
                }
            }
        });

        Arc::clone(&self.rate_limiter).start_cleanup_task();
        Ok(())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Admission plus registration for a new connection. With
    /// `require_token` the credentials are validated before any session or
    /// channel state exists; a bad handshake leaves no trace.
    pub async fn handshake(
        &self,
        remote_addr: Option<IpAddr>,
        tenant_id: String,
        token: Option<&str>,
    ) -> Result<RegisteredSession> {
        if self.is_draining() {
            return Err(GatewayError::ResourceExhausted(
                "gateway is draining".to_string(),
            ));
        }

        self.rate_limiter
            .admit_connection(remote_addr, &tenant_id)
            .await?;

        // Validate credentials before registering anything
        let context = match self.validate_handshake_token(token).await {
            Ok(context) => context,
            Err(e) => {
                self.rate_limiter
                    .release_connection(remote_addr, &tenant_id, None)
                    .await;
                return Err(e);
            }
        };

        if let Some(ref context) = context {
            if let Err(e) = self.rate_limiter.admit_user_connection(&context.user_id).await {
                self.rate_limiter
                    .release_connection(remote_addr, &tenant_id, None)
                    .await;
                return Err(e);
            }
        }

        let registered = self.sessions.register(tenant_id.clone(), remote_addr).await;

        if let Some(context) = context {
            if let Err(e) = self
                .sessions
                .authenticate(&registered.session_id, &context)
                .await
            {
                // Tenant mismatch between token and handshake resolution.
                // IP/tenant counts are released by the terminate cascade;
                // only the user count remains to unwind here.
                self.terminate_session(&registered.session_id, "handshake auth rejected")
                    .await;
                self.rate_limiter
                    .release_connection(None, "", Some(&context.user_id))
                    .await;
                return Err(e);
            }
        }

        Ok(registered)
    }

    async fn validate_handshake_token(&self, token: Option<&str>) -> Result<Option<AuthContext>> {
        if !self.config.auth_enabled {
            return Ok(None);
        }
        match (token, &self.auth) {
            (Some(token), Some(auth)) => match auth.validate(token).await {
                Ok(context) => Ok(Some(context)),
                Err(e) => {
                    self.metrics.record_auth_failure();
                    if self.config.require_token {
                        Err(e)
                    } else {
                        // Optional tokens fail soft: the session stays anonymous
                        log::debug!("Handshake token rejected, continuing anonymous: {}", e);
                        Ok(None)
                    }
                }
            },
            (None, _) if self.config.require_token => Err(GatewayError::Unauthenticated(
                "a token is required to connect".to_string(),
            )),
            _ => Ok(None),
        }
    }

    /// Post-handshake credential validation via an `auth` frame.
    pub async fn authenticate_session(&self, session_id: &str, token: &str) -> Result<AuthContext> {
        let auth = self.auth.as_ref().ok_or_else(|| {
            GatewayError::Unauthenticated("authentication is disabled".to_string())
        })?;

        match auth.validate(token).await {
            Ok(context) => {
                self.rate_limiter
                    .admit_user_connection(&context.user_id)
                    .await?;
                match self.sessions.authenticate(session_id, &context).await {
                    Ok(()) => Ok(context),
                    Err(e) => {
                        self.rate_limiter
                            .release_connection(None, "", Some(&context.user_id))
                            .await;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.metrics.record_auth_failure();
                let attempts = self.sessions.record_auth_failure(session_id).await;
                if attempts >= self.config.max_auth_attempts {
                    log::warn!(
                        "Session {} exceeded {} auth attempts, terminating",
                        session_id,
                        attempts
                    );
                    self.terminate_session(session_id, "auth attempts exceeded")
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Close a session and cascade: channel unsubscription, rate-limit
    /// release, transport shutdown. Idempotent.
    pub async fn terminate_session(&self, session_id: &str, reason: &str) {
        let Some(session) = self.sessions.remove(session_id).await else {
            return;
        };
        self.channels.on_session_terminated(session_id).await;
        self.rate_limiter
            .release_connection(
                session.remote_addr,
                &session.tenant_id,
                session.user_id.as_deref(),
            )
            .await;
        self.rate_limiter.release_session(session_id).await;
        log::info!("Session {} disconnected: {}", session_id, reason);
    }

    /// One inbound text frame from a session. All failures are reported
    /// back to the offending session only.
    pub async fn inbound(&self, session_id: &str, raw: &str) {
        self.metrics.record_message_in();

        if let Err(e) = self.rate_limiter.admit_message(session_id).await {
            self.metrics.record_rate_limited();
            self.sessions
                .send(session_id, &ServerFrame::from_error(&e))
                .await;
            let strikes = self.sessions.record_strike(session_id).await;
            if strikes >= self.config.rate_limit_strikes {
                self.terminate_session(session_id, "rate limit strikes exceeded")
                    .await;
            }
            return;
        }

        if let Err(e) = self.router.dispatch(self, session_id, raw).await {
            self.sessions
                .send(session_id, &ServerFrame::from_error(&e))
                .await;
            if matches!(e, GatewayError::Unauthenticated(_)) && self.config.require_token {
                self.terminate_session(session_id, "unauthenticated").await;
            }
        }
    }

    /// Built-in frame handling, called by the router.
    pub(crate) async fn handle_frame(&self, session_id: &str, frame: ClientFrame) -> Result<()> {
        match frame {
            ClientFrame::Auth { token } => {
                let context = self.authenticate_session(session_id, &token).await?;
                self.sessions
                    .send(
                        session_id,
                        &ServerFrame::Authenticated {
                            user_id: context.user_id,
                            roles: context.roles,
                        },
                    )
                    .await;
                Ok(())
            }
            ClientFrame::Subscribe { channel } => {
                let tenant = self.sessions.tenant_of(session_id).await?;
                self.channels
                    .subscribe(session_id, &tenant, &channel)
                    .await?;
                self.sessions
                    .send(session_id, &ServerFrame::Subscribed { channel })
                    .await;
                Ok(())
            }
            ClientFrame::Unsubscribe { channel } => {
                let tenant = self.sessions.tenant_of(session_id).await?;
                self.channels
                    .unsubscribe(session_id, &tenant, &channel)
                    .await?;
                self.sessions
                    .send(session_id, &ServerFrame::Unsubscribed { channel })
                    .await;
                Ok(())
            }
            ClientFrame::Publish { channel, payload } => {
                let tenant = self.sessions.tenant_of(session_id).await?;
                let key = self.channels.resolve(&tenant, &channel)?;
                let frame =
                    ServerFrame::message(Some(key.clone()), Some(session_id.to_string()), payload);
                self.broadcasts
                    .broadcast(&BroadcastTarget::Channel(key), &frame, Some(session_id))
                    .await?;
                Ok(())
            }
            ClientFrame::Heartbeat => {
                self.sessions.heartbeat(session_id).await;
                self.sessions
                    .send(session_id, &ServerFrame::HeartbeatAck)
                    .await;
                Ok(())
            }
        }
    }

    // ---- Operations exposed to collaborators ----

    pub async fn broadcast_to_channel(
        &self,
        channel_key: &str,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let frame = ServerFrame::message(Some(channel_key.to_string()), None, payload);
        self.broadcasts
            .broadcast(
                &BroadcastTarget::Channel(channel_key.to_string()),
                &frame,
                None,
            )
            .await
    }

    pub async fn broadcast_to_user(
        &self,
        user_id: &str,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let frame = ServerFrame::message(None, None, payload);
        self.broadcasts
            .broadcast(&BroadcastTarget::User(user_id.to_string()), &frame, None)
            .await
    }

    pub async fn broadcast_to_tenant(
        &self,
        tenant_id: &str,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let frame = ServerFrame::message(None, None, payload);
        self.broadcasts
            .broadcast(&BroadcastTarget::Tenant(tenant_id.to_string()), &frame, None)
            .await
    }

    pub async fn broadcast_to_role(&self, role: &str, payload: serde_json::Value) -> Result<usize> {
        let frame = ServerFrame::message(None, None, payload);
        self.broadcasts
            .broadcast(&BroadcastTarget::Role(role.to_string()), &frame, None)
            .await
    }

    pub async fn broadcast_to_all(&self, payload: serde_json::Value) -> Result<usize> {
        let frame = ServerFrame::message(None, None, payload);
        self.broadcasts
            .broadcast(&BroadcastTarget::All, &frame, None)
            .await
    }

    /// Broadcast that fails with `NoEligibleTargets` when nobody can
    /// possibly receive it.
    pub async fn broadcast_confirmed(
        &self,
        target: BroadcastTarget,
        payload: serde_json::Value,
    ) -> Result<usize> {
        let channel = match &target {
            BroadcastTarget::Channel(key) => Some(key.clone()),
            _ => None,
        };
        let frame = ServerFrame::message(channel, None, payload);
        self.broadcasts
            .broadcast_confirmed(&target, &frame, None)
            .await
    }

    /// Register a handler for a custom frame type.
    pub async fn register_message_handler(
        &self,
        frame_type: &str,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<()> {
        self.router.register(frame_type, handler).await
    }

    /// Create a channel that survives an empty subscriber set.
    pub async fn declare_persistent_channel(&self, tenant: &str, name: &str) -> Result<String> {
        self.channels.declare_persistent(tenant, name).await
    }

    pub async fn health_check(&self) -> HealthStatus {
        let backend_health = self.backend.health();
        HealthStatus {
            status: match backend_health {
                BackendHealth::Ok => "healthy",
                BackendHealth::Degraded => "degraded",
            },
            active_sessions: self.sessions.count().await,
            backend: self.backend.name(),
            backend_health,
        }
    }

    pub async fn get_stats(&self) -> GatewayStats {
        GatewayStats {
            gateway_id: self.gateway_id.clone(),
            active_sessions: self.sessions.count().await,
            channel_count: self.channels.channel_count().await,
            backend: self.backend.name(),
            backend_health: self.backend.health(),
            counters: self.metrics.snapshot(),
        }
    }

    /// Drain-window shutdown: refuse new connections, let in-flight
    /// exchanges finish, then force-close what remains.
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::Release);
        log::info!(
            "Draining gateway for {:?} before forced close",
            self.config.drain_window
        );
        tokio::time::sleep(self.config.drain_window).await;
        for session_id in self.sessions.all_ids().await {
            self.terminate_session(&session_id, "shutdown").await;
        }
    }

    // Accessors used by the connection handler and tests
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub fn broadcasts(&self) -> &Arc<BroadcastManager> {
        &self.broadcasts
    }
}

// Shared reference to the gateway manager
pub type SharedGateway = Arc<GatewayManager>;

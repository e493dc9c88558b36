//! Gateway configuration module
//! Handles dynamic configuration parameters for the WebSocket gateway

use crate::constants::{
    DEFAULT_BURST_SIZE, DEFAULT_DRAIN_WINDOW_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HOST,
    DEFAULT_MAX_AUTH_ATTEMPTS, DEFAULT_MAX_CONNECTIONS_PER_IP, DEFAULT_MESSAGES_PER_MINUTE,
    DEFAULT_MISSED_HEARTBEAT_TIMEOUT_SECS, DEFAULT_OUTBOUND_QUEUE_CAPACITY, DEFAULT_PORT,
    DEFAULT_RATE_LIMIT_STRIKES, DEFAULT_WS_PATH,
};
use crate::error::{GatewayError, Result};
use std::env;
use std::time::Duration;

/// Which scaling backend the gateway runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Single-instance, in-process fan-out only
    Local,
    /// Bus-backed fan-out across gateway instances
    Distributed,
}

/// What to do when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued frame to make room
    DropOldest,
    /// Terminate the session
    Disconnect,
}

/// Gateway configuration parameters
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// URL path of the WebSocket upgrade endpoint
    pub ws_path: String,
    pub backend_type: BackendType,
    /// Bus connection string, required for the distributed backend
    pub bus_url: Option<String>,
    /// Master switch for token validation
    pub auth_enabled: bool,
    /// Reject handshakes that do not carry a token
    pub require_token: bool,
    /// HMAC secret for token validation
    pub jwt_secret: Option<String>,
    /// Tolerated clock skew when checking token expiry
    pub clock_skew: Duration,
    /// Failed auth attempts before the session is terminated
    pub max_auth_attempts: u32,
    pub rate_limit_enabled: bool,
    pub max_connections_per_ip: usize,
    /// Aggregate connection cap per user (None = unlimited)
    pub max_connections_per_user: Option<usize>,
    /// Aggregate connection cap per tenant (None = unlimited)
    pub max_connections_per_tenant: Option<usize>,
    pub messages_per_minute: u32,
    pub burst_size: u32,
    /// Rate-limit violations tolerated before an open session is closed
    pub rate_limit_strikes: u32,
    /// Namespace channels per tenant and forbid cross-tenant subscribes
    pub tenant_isolation: bool,
    pub heartbeat_interval: Duration,
    pub missed_heartbeat_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// How long in-flight exchanges may finish during shutdown
    pub drain_window: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        panic!("GatewayConfig::default() is not allowed. Use GatewayConfig::from_env() or build the struct explicitly.");
    }
}

impl GatewayConfig {
    /// Create a configuration suitable for tests: local backend, auth and
    /// rate limiting off, short timers.
    pub fn for_testing() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            backend_type: BackendType::Local,
            bus_url: None,
            auth_enabled: false,
            require_token: false,
            jwt_secret: Some("test-jwt-secret-0123456789-0123456789-xx".to_string()),
            clock_skew: Duration::from_secs(30),
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            rate_limit_enabled: false,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            max_connections_per_user: None,
            max_connections_per_tenant: None,
            messages_per_minute: DEFAULT_MESSAGES_PER_MINUTE,
            burst_size: DEFAULT_BURST_SIZE,
            rate_limit_strikes: DEFAULT_RATE_LIMIT_STRIKES,
            tenant_isolation: false,
            heartbeat_interval: Duration::from_secs(1),
            missed_heartbeat_timeout: Duration::from_secs(3),
            outbound_queue_capacity: 16,
            overflow_policy: OverflowPolicy::DropOldest,
            drain_window: Duration::from_millis(100),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let host = env::var("SWITCHYARD_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = env::var("SWITCHYARD_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let ws_path =
            env::var("SWITCHYARD_WS_PATH").unwrap_or_else(|_| DEFAULT_WS_PATH.to_string());

        let backend_type = match env::var("SWITCHYARD_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => BackendType::Local,
            "distributed" => BackendType::Distributed,
            other => {
                return Err(GatewayError::ConfigError(format!(
                    "Unknown backend type '{}', expected 'local' or 'distributed'",
                    other
                )))
            }
        };

        let bus_url = env::var("SWITCHYARD_BUS_URL").ok();

        let auth_enabled = env_flag("SWITCHYARD_AUTH_ENABLED", true);
        let require_token = env_flag("SWITCHYARD_REQUIRE_TOKEN", false);
        let jwt_secret = env::var("SWITCHYARD_JWT_SECRET")
            .or_else(|_| env::var("JWT_SECRET"))
            .ok();

        let clock_skew_secs = env::var("SWITCHYARD_CLOCK_SKEW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let max_auth_attempts = env::var("SWITCHYARD_MAX_AUTH_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_AUTH_ATTEMPTS);

        let rate_limit_enabled = env_flag("SWITCHYARD_RATE_LIMIT_ENABLED", true);
        let max_connections_per_ip = env::var("SWITCHYARD_MAX_CONN_PER_IP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP);
        let max_connections_per_user = env::var("SWITCHYARD_MAX_CONN_PER_USER")
            .ok()
            .and_then(|v| v.parse().ok());
        let max_connections_per_tenant = env::var("SWITCHYARD_MAX_CONN_PER_TENANT")
            .ok()
            .and_then(|v| v.parse().ok());
        let messages_per_minute = env::var("SWITCHYARD_RATE_LIMIT_MSG_PER_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MESSAGES_PER_MINUTE);
        let burst_size = env::var("SWITCHYARD_RATE_LIMIT_BURST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BURST_SIZE);
        let rate_limit_strikes = env::var("SWITCHYARD_RATE_LIMIT_STRIKES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_STRIKES);

        let tenant_isolation = env_flag("SWITCHYARD_TENANT_ISOLATION", false);

        let heartbeat_interval = env::var("SWITCHYARD_HEARTBEAT_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS));
        let missed_heartbeat_timeout = env::var("SWITCHYARD_MISSED_HEARTBEAT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_MISSED_HEARTBEAT_TIMEOUT_SECS));

        let outbound_queue_capacity = env::var("SWITCHYARD_OUTBOUND_QUEUE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);
        let overflow_policy = match env::var("SWITCHYARD_OVERFLOW_POLICY")
            .unwrap_or_else(|_| "drop_oldest".to_string())
            .to_lowercase()
            .as_str()
        {
            "drop_oldest" => OverflowPolicy::DropOldest,
            "disconnect" => OverflowPolicy::Disconnect,
            other => {
                return Err(GatewayError::ConfigError(format!(
                    "Unknown overflow policy '{}', expected 'drop_oldest' or 'disconnect'",
                    other
                )))
            }
        };

        let drain_window = env::var("SWITCHYARD_DRAIN_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_DRAIN_WINDOW_SECS));

        let config = Self {
            host,
            port,
            ws_path,
            backend_type,
            bus_url,
            auth_enabled,
            require_token,
            jwt_secret,
            clock_skew: Duration::from_secs(clock_skew_secs),
            max_auth_attempts,
            rate_limit_enabled,
            max_connections_per_ip,
            max_connections_per_user,
            max_connections_per_tenant,
            messages_per_minute,
            burst_size,
            rate_limit_strikes,
            tenant_isolation,
            heartbeat_interval,
            missed_heartbeat_timeout,
            outbound_queue_capacity,
            overflow_policy,
            drain_window,
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup-fatal validation. A gateway with an unusable configuration
    /// must not come up at all.
    pub fn validate(&self) -> Result<()> {
        if self.backend_type == BackendType::Distributed && self.bus_url.is_none() {
            return Err(GatewayError::ConfigError(
                "Distributed backend requires SWITCHYARD_BUS_URL".to_string(),
            ));
        }

        if self.require_token && !self.auth_enabled {
            return Err(GatewayError::ConfigError(
                "SWITCHYARD_REQUIRE_TOKEN=true needs SWITCHYARD_AUTH_ENABLED=true".to_string(),
            ));
        }

        if self.auth_enabled {
            match &self.jwt_secret {
                None => {
                    return Err(GatewayError::ConfigError(
                        "SWITCHYARD_JWT_SECRET is required when auth is enabled. \
                         Generate one with: openssl rand -base64 32"
                            .to_string(),
                    ))
                }
                Some(secret) if secret.len() < 32 => {
                    return Err(GatewayError::ConfigError(
                        "JWT secret must be at least 32 characters long".to_string(),
                    ))
                }
                _ => {}
            }
        }

        if self.outbound_queue_capacity == 0 {
            return Err(GatewayError::ConfigError(
                "Outbound queue capacity must be at least 1".to_string(),
            ));
        }

        if self.messages_per_minute == 0 && self.rate_limit_enabled {
            return Err(GatewayError::ConfigError(
                "messages_per_minute must be positive when rate limiting is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "GatewayConfig::default() is not allowed")]
    fn test_default_panics() {
        let _ = GatewayConfig::default();
    }

    #[test]
    fn test_for_testing_is_local_and_open() {
        let config = GatewayConfig::for_testing();
        assert_eq!(config.backend_type, BackendType::Local);
        assert!(!config.require_token);
        assert!(!config.tenant_isolation);
    }

    #[test]
    fn test_validate_rejects_distributed_without_bus() {
        let mut config = GatewayConfig::for_testing();
        config.backend_type = BackendType::Distributed;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("BUS_URL"));
    }

    #[test]
    fn test_validate_rejects_require_token_without_auth() {
        let mut config = GatewayConfig::for_testing();
        config.require_token = true;
        config.auth_enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let mut config = GatewayConfig::for_testing();
        config.auth_enabled = true;
        config.jwt_secret = Some("short".to_string());
        assert!(config.validate().is_err());
    }
}

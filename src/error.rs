use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    // Auth errors
    Unauthenticated(String),
    Unauthorized(String),

    // Admission errors
    RateLimited { retry_after_secs: u64 },
    ResourceExhausted(String),

    // Channel errors
    ChannelNotPermitted(String),
    NoEligibleTargets,

    // Session errors
    SessionNotFound(String),

    // Transport and bus errors
    TransportError(String),
    BackendDegraded(String),
    BusError(String),

    // Protocol errors
    MessageParseError(String),
    MessageTooLarge(usize),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated(msg) => write!(f, "Unauthenticated: {}", msg),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Self::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited, retry after {}s", retry_after_secs)
            }
            Self::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            Self::ChannelNotPermitted(name) => {
                write!(f, "Channel not permitted: {}", name)
            }
            Self::NoEligibleTargets => write!(f, "No eligible broadcast targets"),
            Self::SessionNotFound(id) => write!(f, "Session not found: {}", id),
            Self::TransportError(msg) => write!(f, "Transport error: {}", msg),
            Self::BackendDegraded(msg) => write!(f, "Scaling backend degraded: {}", msg),
            Self::BusError(msg) => write!(f, "Bus error: {}", msg),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::MessageTooLarge(size) => write!(f, "Message too large: {} bytes", size),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for GatewayError {}

impl GatewayError {
    /// Stable error code reported to clients in `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Unauthorized(_) => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::ChannelNotPermitted(_) => "channel_not_permitted",
            Self::NoEligibleTargets => "no_eligible_targets",
            Self::SessionNotFound(_) => "session_not_found",
            Self::TransportError(_) => "transport_error",
            Self::BackendDegraded(_) => "backend_degraded",
            Self::BusError(_) => "bus_error",
            Self::MessageParseError(_) => "message_parse_error",
            Self::MessageTooLarge(_) => "message_too_large",
            Self::ConfigError(_) => "config_error",
        }
    }
}

// Generic result type for the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;

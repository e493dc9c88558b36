//! Wire envelopes and bus message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw wire frame: `{"type": ..., "data": ...}`. Used to peek at the frame
/// type before dispatch so unknown types can be rejected with context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Client-to-gateway frame types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Authenticate an open session with a bearer token
    #[serde(rename = "auth")]
    Auth { token: String },

    /// Subscribe to a channel
    #[serde(rename = "subscribe")]
    Subscribe { channel: String },

    /// Unsubscribe from a channel
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channel: String },

    /// Publish a payload to a channel
    #[serde(rename = "publish")]
    Publish {
        channel: String,
        payload: serde_json::Value,
    },

    /// Keepalive; resets the session idle timer
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// Gateway-to-client frame types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Handshake accepted
    #[serde(rename = "connected")]
    Connected {
        session_id: String,
        tenant_id: String,
        authenticated: bool,
    },

    /// Credential validation succeeded
    #[serde(rename = "authenticated")]
    Authenticated {
        user_id: String,
        roles: Vec<String>,
    },

    /// Subscribe applied (idempotent: repeated subscribes re-acknowledge)
    #[serde(rename = "subscribed")]
    Subscribed { channel: String },

    /// Unsubscribe applied
    #[serde(rename = "unsubscribed")]
    Unsubscribed { channel: String },

    /// A delivered broadcast
    #[serde(rename = "message")]
    Message {
        message_id: Uuid,
        channel: Option<String>,
        sender: Option<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// Heartbeat acknowledgement
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck,

    /// Structured error, reported only to the offending session
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

impl ServerFrame {
    /// Build a broadcastable message frame with a fresh id and timestamp.
    pub fn message(
        channel: Option<String>,
        sender: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::Message {
            message_id: Uuid::new_v4(),
            channel,
            sender,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Convert a gateway error into its client-visible form.
    pub fn from_error(err: &crate::error::GatewayError) -> Self {
        let retry_after_secs = match err {
            crate::error::GatewayError::RateLimited { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        };
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            retry_after_secs,
        }
    }
}

/// The targeting dimension of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum BroadcastTarget {
    /// A channel key (tenant-qualified when isolation is enabled)
    Channel(String),
    /// Every session of one user
    User(String),
    /// Every session holding a role
    Role(String),
    /// Every session of a tenant
    Tenant(String),
    /// Every locally connected session
    All,
}

/// Envelope relayed between gateway instances through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Gateway instance that first published this message
    pub origin: String,
    pub target: BroadcastTarget,
    /// Used by receivers to suppress duplicate relays
    pub message_id: Uuid,
    pub frame: ServerFrame,
}

//! Inbound frame dispatch
//!
//! Built-in frame types map onto the tagged `ClientFrame` enum; anything
//! else goes through the registered-handler table. Unknown types are
//! rejected by default.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::constants::MAX_FRAME_BYTES;
use crate::core::message::{ClientFrame, Envelope};
use crate::core::server::GatewayManager;
use crate::error::{GatewayError, Result};

/// Frame types handled by the gateway itself; not available for
/// collaborator registration.
const BUILTIN_TYPES: &[&str] = &["auth", "subscribe", "unsubscribe", "publish", "heartbeat"];

/// Collaborator-registered handler for a custom frame type
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle(
        &self,
        gateway: &GatewayManager,
        session_id: &str,
        data: serde_json::Value,
    ) -> Result<()>;
}

/// Maps frame types to handler capability
pub struct MessageRouter {
    handlers: RwLock<HashMap<String, Arc<dyn FrameHandler>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a custom frame type. Built-in types are
    /// reserved and cannot be shadowed.
    pub async fn register(&self, frame_type: &str, handler: Arc<dyn FrameHandler>) -> Result<()> {
        if BUILTIN_TYPES.contains(&frame_type) {
            return Err(GatewayError::ConfigError(format!(
                "'{}' is a built-in frame type",
                frame_type
            )));
        }
        self.handlers
            .write()
            .await
            .insert(frame_type.to_string(), handler);
        Ok(())
    }

    /// Parse and dispatch one raw text frame from a session.
    pub async fn dispatch(
        &self,
        gateway: &GatewayManager,
        session_id: &str,
        raw: &str,
    ) -> Result<()> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(GatewayError::MessageTooLarge(raw.len()));
        }

        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| GatewayError::MessageParseError(format!("Invalid JSON: {}", e)))?;

        if BUILTIN_TYPES.contains(&envelope.frame_type.as_str()) {
            let frame: ClientFrame = serde_json::from_str(raw).map_err(|e| {
                GatewayError::MessageParseError(format!(
                    "Malformed '{}' frame: {}",
                    envelope.frame_type, e
                ))
            })?;
            return gateway.handle_frame(session_id, frame).await;
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&envelope.frame_type).cloned()
        };
        match handler {
            Some(handler) => handler.handle(gateway, session_id, envelope.data).await,
            None => Err(GatewayError::MessageParseError(format!(
                "Unknown message type '{}'",
                envelope.frame_type
            ))),
        }
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

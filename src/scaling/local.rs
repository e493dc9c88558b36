//! Single-instance scaling backend

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::message::BusMessage;
use crate::error::Result;
use crate::scaling::{BackendHealth, ScalingBackend};

/// No peers, no bus: local fan-out is the whole story. Publish is a no-op
/// because the broadcast manager has already delivered to every local
/// member by the time it reaches the backend.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScalingBackend for LocalBackend {
    async fn start(&self, _relay: mpsc::Sender<BusMessage>) -> Result<()> {
        Ok(())
    }

    async fn register_interest(&self, _channel_key: &str) -> Result<()> {
        Ok(())
    }

    async fn deregister_interest(&self, _channel_key: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, _message: &BusMessage) -> Result<()> {
        Ok(())
    }

    fn health(&self) -> BackendHealth {
        BackendHealth::Ok
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
